use std::fmt;

use serde::{Deserialize, Serialize};

/// Source channel message id (Telegram channel post id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceMessageId(pub i64);

impl fmt::Display for SourceMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message fetched from the source channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: SourceMessageId,
    pub text: String,
    pub origin_url: String,
}

/// Id of a post on the destination platform (tweet id).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub String);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One post-sized chunk of a formatted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// 1-based position in the thread.
    pub position: usize,
    pub total: usize,
    pub text: String,
}

/// Ordered, platform-ready segments for one source message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormattedPost {
    pub segments: Vec<Segment>,
}

impl FormattedPost {
    pub fn texts(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.text.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Outcome of publishing one thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishResult {
    pub root_post_id: PostId,
    pub post_ids: Vec<PostId>,
    pub success: bool,
}

/// What the translator gateway did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationDecision {
    /// Already in the target language; no network call was made.
    Keep,
    Translated,
    /// Translation was needed but failed; the original text is used.
    Fallback,
}

/// Languages the relay can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetLanguage {
    Russian,
}

impl TargetLanguage {
    pub fn code(self) -> &'static str {
        match self {
            TargetLanguage::Russian => "ru",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetLanguage::Russian => "Russian",
        }
    }
}

/// External services, for error reporting and log fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    Source,
    Translation,
    Publishing,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Service::Source => "source",
            Service::Translation => "translation",
            Service::Publishing => "publishing",
        })
    }
}

/// A thread whose first posts went live before a failure.
///
/// Keeps the exact segment texts so a later run finishes the same thread
/// instead of re-formatting (and possibly re-translating) the message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialThread {
    pub posted: Vec<PostId>,
    pub segments: Vec<String>,
}

impl PartialThread {
    pub fn last_posted(&self) -> Option<&PostId> {
        self.posted.last()
    }

    pub fn is_complete(&self) -> bool {
        !self.segments.is_empty() && self.posted.len() >= self.segments.len()
    }
}
