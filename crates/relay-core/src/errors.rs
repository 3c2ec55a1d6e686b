use crate::domain::Service;

/// Core error type for the relay.
///
/// Adapter crates map their transport errors into `Transient`, `Terminal` or
/// `AuthExpired` so the pipeline can decide between retry, refresh and skip
/// without knowing which service failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transient {service} error: {message}")]
    Transient { service: Service, message: String },

    #[error("terminal {service} error: {message}")]
    Terminal { service: Service, message: String },

    #[error("{service} authentication expired: {message}")]
    AuthExpired { service: Service, message: String },

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn transient(service: Service, message: impl Into<String>) -> Self {
        Error::Transient {
            service,
            message: message.into(),
        }
    }

    pub fn terminal(service: Service, message: impl Into<String>) -> Self {
        Error::Terminal {
            service,
            message: message.into(),
        }
    }

    pub fn auth_expired(service: Service, message: impl Into<String>) -> Self {
        Error::AuthExpired {
            service,
            message: message.into(),
        }
    }

    /// Whether the retry runner should try the call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Error::AuthExpired { .. })
    }
}

/// Content that cannot be turned into a post. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("message text is empty after normalization")]
    Empty,

    #[error("origin link does not fit in a single post")]
    SourceLinkTooLong,
}

pub type Result<T> = std::result::Result<T, Error>;
