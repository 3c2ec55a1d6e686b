//! X (Twitter) adapter: API v2 tweets with an OAuth2 refresh-token grant.
//!
//! X rotates the refresh token on every grant. The newest one is written to
//! durable storage and preferred over the configured token on the next run.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use relay_core::{
    domain::{PostId, Service},
    errors::Error,
    ports::{DurableStorage, PublishingPort},
    Result,
};

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com";
pub const TOKEN_KEY: &str = "publisher-token";

/// Access tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The grant must finish, rotated token included, well inside one attempt.
fn refresh_timeout_for(attempt_timeout: Duration) -> Duration {
    attempt_timeout / 2
}

#[derive(Clone, Debug)]
pub struct TwitterCredentials {
    pub client_id: String,
    pub refresh_token: String,
    pub redirect_uri: String,
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: String,
}

impl TokenState {
    fn usable_at(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        let expires_at = self.expires_at?;
        if now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) < expires_at {
            Some(token)
        } else {
            None
        }
    }
}

/// Persisted under [`TOKEN_KEY`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    refresh_token: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_expires_in() -> i64 {
    7200
}

#[derive(Debug, Serialize)]
struct TweetRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<TweetReply<'a>>,
}

#[derive(Debug, Serialize)]
struct TweetReply<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TweetResponse {
    data: Option<TweetData>,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
}

pub struct TwitterClient {
    http: reqwest::Client,
    api_base: String,
    client_id: String,
    redirect_uri: String,
    refresh_timeout: Duration,
    tokens: Mutex<TokenState>,
    storage: Option<Arc<dyn DurableStorage>>,
}

impl TwitterClient {
    pub fn new(creds: TwitterCredentials, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("twitter http client: {e}")))?;

        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            client_id: creds.client_id,
            redirect_uri: creds.redirect_uri,
            refresh_timeout: refresh_timeout_for(timeout),
            tokens: Mutex::new(TokenState {
                refresh_token: creds.refresh_token,
                ..TokenState::default()
            }),
            storage: None,
        })
    }

    pub fn with_api_base(mut self, url: &str) -> Self {
        self.api_base = url.trim_end_matches('/').to_string();
        self
    }

    /// Persist rotated refresh tokens in `storage`, and start from the stored
    /// one if it exists.
    pub fn with_token_store(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        match load_stored_token(storage.as_ref()) {
            Ok(Some(stored)) => {
                tracing::info!(updated_at = %stored.updated_at, "using stored refresh token");
                self.tokens.get_mut().refresh_token = stored.refresh_token;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "stored refresh token unreadable, using configured one"),
        }
        self.storage = Some(storage);
        self
    }

    async fn access_token(&self) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.usable_at(Utc::now()) {
            return Ok(token.to_string());
        }
        self.refresh_locked(&mut tokens).await?;
        tokens
            .access_token
            .clone()
            .ok_or_else(|| Error::terminal(Service::Publishing, "no access token after refresh"))
    }

    async fn refresh_locked(&self, tokens: &mut TokenState) -> Result<()> {
        let url = format!("{}/2/oauth2/token", self.api_base);
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", tokens.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let resp = self
            .http
            .post(&url)
            .timeout(self.refresh_timeout)
            .form(&form)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_token_status(status, &body));
        }

        let parsed: TokenResponse = resp.json().await.map_err(|e| {
            Error::terminal(Service::Publishing, format!("token response json error: {e}"))
        })?;

        tokens.access_token = Some(parsed.access_token);
        tokens.expires_at =
            Some(Utc::now() + chrono::Duration::seconds(parsed.expires_in.clamp(0, 30 * 86_400)));

        if let Some(rotated) = parsed.refresh_token.filter(|t| *t != tokens.refresh_token) {
            tokens.refresh_token = rotated;
            self.persist_refresh_token(&tokens.refresh_token);
        }

        tracing::info!(expires_in = parsed.expires_in, "access token refreshed");
        Ok(())
    }

    fn persist_refresh_token(&self, refresh_token: &str) {
        let Some(storage) = &self.storage else {
            return;
        };
        let stored = StoredToken {
            refresh_token: refresh_token.to_string(),
            updated_at: Utc::now(),
        };
        let written = serde_json::to_vec_pretty(&stored)
            .map_err(Error::from)
            .and_then(|bytes| storage.atomic_write(TOKEN_KEY, &bytes));
        if let Err(e) = written {
            // The in-memory token keeps this run going; the next run will
            // need a fresh token from the operator.
            tracing::error!(error = %e, "failed to persist rotated refresh token");
        }
    }
}

fn load_stored_token(storage: &dyn DurableStorage) -> Result<Option<StoredToken>> {
    let Some(bytes) = storage.read(TOKEN_KEY)? else {
        return Ok(None);
    };
    let stored: StoredToken = serde_json::from_slice(&bytes)?;
    if stored.refresh_token.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(stored))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// 401 means the access token is no longer accepted.
fn classify_post_status(status: StatusCode, body: &str) -> Error {
    let message = format!("tweet rejected {status}: {}", snippet(body));
    if status == StatusCode::UNAUTHORIZED {
        Error::auth_expired(Service::Publishing, message)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::transient(Service::Publishing, message)
    } else {
        Error::terminal(Service::Publishing, message)
    }
}

/// A rejected refresh token (400/401) cannot be fixed by retrying.
fn classify_token_status(status: StatusCode, body: &str) -> Error {
    let message = format!("token refresh failed {status}: {}", snippet(body));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::transient(Service::Publishing, message)
    } else {
        Error::terminal(Service::Publishing, message)
    }
}

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::transient(Service::Publishing, format!("twitter request error: {e}"))
    } else {
        Error::terminal(Service::Publishing, format!("twitter request error: {e}"))
    }
}

#[async_trait]
impl PublishingPort for TwitterClient {
    async fn post(&self, text: &str, in_reply_to: Option<&PostId>) -> Result<PostId> {
        let token = self.access_token().await?;
        let body = TweetRequest {
            text,
            reply: in_reply_to.map(|id| TweetReply {
                in_reply_to_tweet_id: id.0.as_str(),
            }),
        };

        let resp = self
            .http
            .post(format!("{}/2/tweets", self.api_base))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = classify_post_status(status, &body);
            if err.is_auth_expired() {
                self.tokens.lock().await.access_token = None;
            }
            return Err(err);
        }

        let parsed: TweetResponse = resp.json().await.map_err(|e| {
            Error::terminal(Service::Publishing, format!("tweet response json error: {e}"))
        })?;
        let id = parsed
            .data
            .map(|d| d.id)
            .ok_or_else(|| Error::terminal(Service::Publishing, "tweet response without id"))?;

        tracing::info!(tweet_id = %id, reply_to = ?in_reply_to.map(|p| p.0.as_str()), "tweet published");
        Ok(PostId(id))
    }

    async fn refresh_auth(&self) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        self.refresh_locked(&mut tokens).await
    }
}
