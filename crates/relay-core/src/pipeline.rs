//! Run orchestration: fetch → translate → format → publish → checkpoint.
//!
//! Messages are handled strictly one at a time, oldest first. The checkpoint
//! only moves after the destination confirmed the whole thread, and never past
//! a message that failed in this run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    domain::{
        FormattedPost, PartialThread, PublishResult, Segment, SourceMessage, SourceMessageId,
        TranslationDecision,
    },
    errors::{Error, FormatError},
    formatting::Formatter,
    ports::SourcePort,
    publisher::{PublishFailure, Publisher},
    state::CheckpointStore,
    translator::Translator,
    Result,
};

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Translate and format only: no publishing, no checkpoint writes.
    pub dry_run: bool,
    /// Auxiliary links appended after every message body.
    pub link_block: String,
    /// Consecutive failed runs after which a message is reported as stuck.
    pub stuck_threshold: u32,
}

/// Counts for one run, logged at the end.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dry_run: bool,
    pub fetched: usize,
    pub processed: usize,
    pub skipped: usize,
    pub unformattable: usize,
    pub already_published: usize,
    pub translated: usize,
    pub fallbacks: usize,
    /// Messages at or over the stuck threshold, with their failure count.
    pub stuck: Vec<(SourceMessageId, u32)>,
    pub cancelled: bool,
}

enum Stage {
    Published(PublishResult),
    DryRun(FormattedPost),
    Unformattable(FormatError),
    Failed(PublishFailure),
}

struct MessageOutcome {
    decision: Option<TranslationDecision>,
    stage: Stage,
}

pub struct Pipeline {
    source: Arc<dyn SourcePort>,
    translator: Translator,
    formatter: Formatter,
    publisher: Option<Publisher>,
    options: PipelineOptions,
}

impl Pipeline {
    /// `publisher` may only be absent for dry runs.
    pub fn new(
        source: Arc<dyn SourcePort>,
        translator: Translator,
        formatter: Formatter,
        publisher: Option<Publisher>,
        options: PipelineOptions,
    ) -> Result<Self> {
        if publisher.is_none() && !options.dry_run {
            return Err(Error::Config(
                "a publisher is required unless running with --dry-run".to_string(),
            ));
        }
        Ok(Self {
            source,
            translator,
            formatter,
            publisher,
            options,
        })
    }

    /// Process everything newer than the checkpoint.
    ///
    /// Per-message failures are logged and counted; only source and storage
    /// failures end the run with an error.
    pub async fn run(
        &self,
        store: &mut CheckpointStore,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let dry_run = self.options.dry_run;
        let checkpoint = store.checkpoint().last_processed_id;
        tracing::info!(
            last_processed_id = ?checkpoint.map(|id| id.0),
            dry_run,
            "run started"
        );

        let mut messages = self.source.fetch_since(checkpoint).await?;
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        messages.retain(|m| checkpoint.map_or(true, |last| m.id > last));

        let mut summary = RunSummary {
            dry_run,
            fetched: messages.len(),
            ..RunSummary::default()
        };

        if messages.is_empty() {
            tracing::info!(last_processed_id = ?checkpoint.map(|id| id.0), "no new messages");
            return Ok(summary);
        }

        // Set once a message fails: later successes are recorded but the
        // checkpoint stays behind the failed message.
        let mut blocked = false;

        for msg in &messages {
            if cancel.is_cancelled() {
                tracing::warn!(next_message_id = %msg.id, "run cancelled, stopping before next message");
                summary.cancelled = true;
                break;
            }

            if store.is_completed_ahead(msg.id) {
                summary.already_published += 1;
                tracing::info!(message_id = %msg.id, "already published in an earlier run");
                if !blocked && !dry_run {
                    store.commit(msg.id)?;
                }
                continue;
            }

            let resume = store.partial_thread(msg.id).cloned();
            let outcome = self.process(msg, resume).await;

            match outcome.decision {
                Some(TranslationDecision::Translated) => summary.translated += 1,
                Some(TranslationDecision::Fallback) => summary.fallbacks += 1,
                _ => {}
            }

            match outcome.stage {
                Stage::DryRun(post) => {
                    summary.processed += 1;
                    tracing::info!(
                        message_id = %msg.id,
                        segments = post.len(),
                        "dry run: formatted, not published"
                    );
                    for seg in &post.segments {
                        tracing::info!(
                            message_id = %msg.id,
                            position = seg.position,
                            total = seg.total,
                            text = %seg.text,
                            "dry run segment"
                        );
                    }
                }
                Stage::Published(result) => {
                    summary.processed += 1;
                    tracing::info!(
                        message_id = %msg.id,
                        root_post_id = %result.root_post_id,
                        posts = result.post_ids.len(),
                        "processed"
                    );
                    self.mark_done(store, msg.id, blocked)?;
                }
                Stage::Unformattable(e) => {
                    summary.skipped += 1;
                    summary.unformattable += 1;
                    tracing::warn!(message_id = %msg.id, reason = %e, "skipped: cannot be formatted, not retrying");
                    self.mark_done(store, msg.id, blocked)?;
                }
                Stage::Failed(failure) => {
                    summary.skipped += 1;
                    blocked = true;
                    let posted = failure.partial.as_ref().map_or(0, |p| p.posted.len());
                    tracing::warn!(
                        message_id = %msg.id,
                        reason = %failure.error,
                        posted_segments = posted,
                        "skipped: publish failed, will retry next run"
                    );
                    if !dry_run {
                        let count = store.record_failure(
                            msg.id,
                            &failure.error.to_string(),
                            failure.partial,
                        )?;
                        if count >= self.options.stuck_threshold {
                            tracing::error!(
                                message_id = %msg.id,
                                failed_runs = count,
                                "message is stuck, operator attention needed"
                            );
                            summary.stuck.push((msg.id, count));
                        }
                    }
                }
            }
        }

        tracing::info!(
            fetched = summary.fetched,
            processed = summary.processed,
            skipped = summary.skipped,
            already_published = summary.already_published,
            translated = summary.translated,
            fallbacks = summary.fallbacks,
            stuck = summary.stuck.len(),
            dry_run,
            last_processed_id = ?store.checkpoint().last_processed_id.map(|id| id.0),
            "run finished"
        );

        Ok(summary)
    }

    async fn process(&self, msg: &SourceMessage, resume: Option<PartialThread>) -> MessageOutcome {
        // A half-posted thread is finished with the exact texts already chosen.
        if let (Some(partial), Some(publisher)) = (resume.as_ref(), self.publisher.as_ref()) {
            if !self.options.dry_run {
                let post = post_from_partial(partial);
                let stage = match publisher.publish(msg.id, &post, Some(partial)).await {
                    Ok(res) => Stage::Published(res),
                    Err(f) => Stage::Failed(f),
                };
                return MessageOutcome {
                    decision: None,
                    stage,
                };
            }
        }

        let translation = self.translator.maybe_translate(&msg.text).await;
        let decision = Some(translation.decision);

        let post = match self.formatter.format(
            &translation.text,
            &msg.origin_url,
            &self.options.link_block,
            translation.decision,
        ) {
            Ok(post) => post,
            Err(e) => {
                return MessageOutcome {
                    decision,
                    stage: Stage::Unformattable(e),
                }
            }
        };

        let stage = match (&self.publisher, self.options.dry_run) {
            (Some(publisher), false) => match publisher.publish(msg.id, &post, None).await {
                Ok(res) => Stage::Published(res),
                Err(f) => Stage::Failed(f),
            },
            _ => Stage::DryRun(post),
        };

        MessageOutcome { decision, stage }
    }

    fn mark_done(&self, store: &mut CheckpointStore, id: SourceMessageId, blocked: bool) -> Result<()> {
        if self.options.dry_run {
            return Ok(());
        }
        if blocked {
            store.defer(id)
        } else {
            store.commit(id)
        }
    }
}

fn post_from_partial(partial: &PartialThread) -> FormattedPost {
    let total = partial.segments.len();
    FormattedPost {
        segments: partial
            .segments
            .iter()
            .enumerate()
            .map(|(i, text)| Segment {
                position: i + 1,
                total,
                text: text.clone(),
            })
            .collect(),
    }
}
