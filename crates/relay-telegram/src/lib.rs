//! Telegram adapter (teloxide).
//!
//! Implements the `relay-core` SourcePort over the Bot API. The bot must be an
//! administrator of the source channel to receive its posts, and Telegram
//! keeps unconfirmed updates for roughly a day.
//!
//! With a backlog store, every pending update is read each run: posts the
//! relay has not finished are written to the backlog before Telegram is told
//! to drop them, so a stuck post never hides the ones behind it.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{AllowedUpdate, Update, UpdateKind},
    RequestError,
};

use relay_core::{
    domain::{Service, SourceMessage, SourceMessageId},
    errors::Error,
    ports::{DurableStorage, SourcePort},
    retry::RetryPolicy,
    Result,
};

pub const BACKLOG_KEY: &str = "source-backlog";

/// Upper bound on `getUpdates` pages read in one run.
const MAX_PAGES: usize = 50;

#[derive(Clone)]
pub struct TelegramSource {
    bot: Bot,
    channel: String,
    fetch_limit: u8,
    retry: RetryPolicy,
    backlog: Option<Backlog>,
}

impl TelegramSource {
    pub fn new(bot: Bot, channel: impl Into<String>, fetch_limit: u8, retry: RetryPolicy) -> Self {
        Self {
            bot,
            channel: channel.into(),
            fetch_limit: fetch_limit.clamp(1, 100),
            retry,
            backlog: None,
        }
    }

    /// Keep unfinished posts in `storage` and read the whole update queue
    /// on every run.
    pub fn with_backlog(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.backlog = Some(Backlog {
            storage,
            writable: true,
        });
        self
    }

    /// Offer posts already in the backlog without ever writing it.
    pub fn with_read_only_backlog(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.backlog = Some(Backlog {
            storage,
            writable: false,
        });
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::RetryAfter(d) => {
                Error::transient(Service::Source, format!("telegram flood control, retry after {d:?}"))
            }
            RequestError::Network(e) => Error::transient(Service::Source, format!("telegram network error: {e}")),
            RequestError::Io(e) => Error::transient(Service::Source, format!("telegram i/o error: {e}")),
            other => Error::terminal(Service::Source, format!("telegram error: {other}")),
        }
    }

    async fn get_updates(&self, offset: Option<i32>, limit: u8) -> Result<Vec<Update>> {
        self.retry
            .run(Service::Source, "get updates", || async move {
                let mut req = self
                    .bot
                    .get_updates()
                    .limit(limit)
                    .timeout(0)
                    .allowed_updates(vec![AllowedUpdate::ChannelPost]);
                if let Some(offset) = offset {
                    req = req.offset(offset);
                }
                req.send().await.map_err(Self::map_err)
            })
            .await
    }
}

/// One `getUpdates` page. A call with `offset` confirms every update below it.
#[async_trait]
trait UpdateFeed: Send + Sync {
    async fn page(&self, offset: Option<i32>, limit: u8) -> Result<Vec<ChannelPost>>;
}

#[async_trait]
impl UpdateFeed for TelegramSource {
    async fn page(&self, offset: Option<i32>, limit: u8) -> Result<Vec<ChannelPost>> {
        let updates = self.get_updates(offset, limit).await?;
        Ok(updates.iter().map(ChannelPost::from_update).collect())
    }
}

/// Posts newer than the checkpoint that Telegram no longer holds.
#[derive(Clone)]
struct Backlog {
    storage: Arc<dyn DurableStorage>,
    writable: bool,
}

impl Backlog {
    fn load(&self) -> Result<Vec<SourceMessage>> {
        let Some(bytes) = self.storage.read(BACKLOG_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice(&bytes) {
            Ok(posts) => Ok(posts),
            Err(e) => {
                tracing::warn!(error = %e, "source backlog is corrupt, ignoring it");
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, posts: &BTreeMap<SourceMessageId, SourceMessage>) -> Result<()> {
        let list: Vec<&SourceMessage> = posts.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        self.storage.atomic_write(BACKLOG_KEY, &bytes)
    }
}

/// Read every pending update. New posts are saved to the backlog before the
/// next page request confirms them.
async fn drain_into_backlog<F: UpdateFeed + ?Sized>(
    feed: &F,
    backlog: &Backlog,
    channel: &str,
    limit: u8,
    since: Option<SourceMessageId>,
) -> Result<Vec<SourceMessage>> {
    let stored = backlog.load()?;
    let stored_len = stored.len();
    let mut pending = newer_than(stored, since);
    // Entries at or below the checkpoint are done.
    let mut dirty = pending.len() != stored_len;
    let mut offset = None;

    for _ in 0..MAX_PAGES {
        let posts = feed.page(offset, limit).await?;
        let Some(last) = posts.iter().map(|p| p.update_id).max() else {
            break;
        };
        for post in posts.iter().filter(|p| p.is_relevant(channel)) {
            let message = post.to_message(channel);
            if is_newer(message.id, since) && !pending.contains_key(&message.id) {
                pending.insert(message.id, message);
                dirty = true;
            }
        }
        if dirty {
            backlog.save(&pending)?;
            dirty = false;
        }
        offset = Some(last + 1);
    }

    if dirty {
        backlog.save(&pending)?;
    }
    Ok(pending.into_values().collect())
}

/// Without a writable backlog only a leading run of settled updates is
/// confirmed, and paging stops at the first page holding a pending post.
async fn scan_settled<F: UpdateFeed + ?Sized>(
    feed: &F,
    channel: &str,
    limit: u8,
    since: Option<SourceMessageId>,
) -> Result<Vec<SourceMessage>> {
    let mut messages = Vec::new();
    let mut offset = None;

    for _ in 0..MAX_PAGES {
        let posts = feed.page(offset, limit).await?;
        let (found, confirm) = plan(&posts, channel, since);
        let settled_page = found.is_empty() && posts.len() == usize::from(limit);
        messages.extend(found);
        match confirm {
            Some(next) if settled_page => offset = Some(next),
            Some(next) => {
                // Telegram drops every update below `next` once it is requested.
                feed.page(Some(next), 1).await?;
                tracing::debug!(offset = next, "confirmed settled updates");
                break;
            }
            None => break,
        }
    }
    Ok(messages)
}

fn is_newer(id: SourceMessageId, since: Option<SourceMessageId>) -> bool {
    since.map_or(true, |s| id > s)
}

fn newer_than(
    messages: Vec<SourceMessage>,
    since: Option<SourceMessageId>,
) -> BTreeMap<SourceMessageId, SourceMessage> {
    messages
        .into_iter()
        .filter(|m| is_newer(m.id, since))
        .map(|m| (m.id, m))
        .collect()
}

/// The parts of an update the relay looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChannelPost {
    update_id: i32,
    chat_id: i64,
    chat_username: Option<String>,
    message_id: i32,
    text: Option<String>,
}

impl ChannelPost {
    fn from_update(update: &Update) -> Self {
        match &update.kind {
            UpdateKind::ChannelPost(msg) => Self {
                update_id: update.id,
                chat_id: msg.chat.id.0,
                chat_username: msg.chat.username().map(str::to_string),
                message_id: msg.id.0,
                text: msg.text().or_else(|| msg.caption()).map(str::to_string),
            },
            _ => Self {
                update_id: update.id,
                chat_id: 0,
                chat_username: None,
                message_id: 0,
                text: None,
            },
        }
    }

    /// A text post from the source channel.
    fn is_relevant(&self, channel: &str) -> bool {
        self.is_from(channel) && self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    fn to_message(&self, channel: &str) -> SourceMessage {
        SourceMessage {
            id: SourceMessageId(i64::from(self.message_id)),
            text: self.text.clone().unwrap_or_default(),
            origin_url: origin_url(channel, self.chat_id, self.message_id),
        }
    }

    fn is_from(&self, channel: &str) -> bool {
        if let Ok(id) = channel.parse::<i64>() {
            return self.chat_id == id;
        }
        self.chat_username
            .as_deref()
            .is_some_and(|u| u.eq_ignore_ascii_case(channel))
    }
}

/// Messages to hand out, plus the offset that confirms every update the
/// checkpoint already covers.
///
/// Only a leading run of settled updates is confirmed, so anything newer
/// than the checkpoint is offered again on the next run.
fn plan(
    posts: &[ChannelPost],
    channel: &str,
    since: Option<SourceMessageId>,
) -> (Vec<SourceMessage>, Option<i32>) {
    let mut messages = Vec::new();
    let mut confirm_upto = None;
    let mut settled = true;

    for post in posts {
        let newer = is_newer(SourceMessageId(i64::from(post.message_id)), since);
        if post.is_relevant(channel) && newer {
            settled = false;
            messages.push(post.to_message(channel));
        } else if settled {
            confirm_upto = Some(post.update_id);
        }
    }

    (messages, confirm_upto.map(|u| u + 1))
}

fn origin_url(channel: &str, chat_id: i64, message_id: i32) -> String {
    if channel.parse::<i64>().is_ok() {
        // Private channels: t.me/c/<id without the -100 prefix>/<message>
        let internal = chat_id.to_string();
        let internal = internal.strip_prefix("-100").unwrap_or(&internal);
        return format!("https://t.me/c/{internal}/{message_id}");
    }
    format!("https://t.me/{channel}/{message_id}")
}

#[async_trait]
impl SourcePort for TelegramSource {
    async fn fetch_since(&self, since: Option<SourceMessageId>) -> Result<Vec<SourceMessage>> {
        tracing::info!(
            channel = %self.channel,
            last_processed_id = ?since.map(|id| id.0),
            "fetching channel posts"
        );

        let messages = match &self.backlog {
            Some(backlog) if backlog.writable => {
                drain_into_backlog(self, backlog, &self.channel, self.fetch_limit, since).await?
            }
            read_only => {
                let mut known = match read_only {
                    Some(backlog) => newer_than(backlog.load()?, since),
                    None => BTreeMap::new(),
                };
                for message in scan_settled(self, &self.channel, self.fetch_limit, since).await? {
                    known.entry(message.id).or_insert(message);
                }
                known.into_values().collect()
            }
        };

        tracing::info!(
            channel = %self.channel,
            count = messages.len(),
            "fetched channel posts"
        );
        Ok(messages)
    }
}
