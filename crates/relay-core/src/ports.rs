use async_trait::async_trait;

use crate::{domain::*, Result};

/// Hexagonal port for the source channel.
///
/// Implementations apply their own reconnect/retry policy and only surface
/// terminal failures.
#[async_trait]
pub trait SourcePort: Send + Sync {
    /// Messages strictly newer than `since`, in any order. Empty when caught up.
    async fn fetch_since(&self, since: Option<SourceMessageId>) -> Result<Vec<SourceMessage>>;
}

/// Hexagonal port for the translation/rephrasing service.
///
/// Errors must be classified: `Error::Transient` is retried by the gateway,
/// anything else makes it fall back to the original text.
#[async_trait]
pub trait TranslationPort: Send + Sync {
    async fn translate(&self, text: &str, target: TargetLanguage) -> Result<String>;
}

/// Hexagonal port for the destination platform.
///
/// The publisher builds a thread out of single posts so it can track which
/// segments are live. `Error::AuthExpired` makes the publisher call
/// `refresh_auth` once and retry the in-flight post.
#[async_trait]
pub trait PublishingPort: Send + Sync {
    async fn post(&self, text: &str, in_reply_to: Option<&PostId>) -> Result<PostId>;
    async fn refresh_auth(&self) -> Result<()>;
}

/// Key/value durable storage with atomic replace.
pub trait DurableStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value of `key`; a crash mid-write leaves the old value intact.
    fn atomic_write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}
