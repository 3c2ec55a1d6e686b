//! DeepSeek adapter (chat completions used as a translator).
//!
//! One HTTP attempt per call; retries and fallback belong to the core
//! `Translator`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use relay_core::{
    domain::{Service, TargetLanguage},
    errors::Error,
    ports::TranslationPort,
    Result,
};

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

#[derive(Clone, Debug)]
pub struct DeepSeekClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl DeepSeekClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("deepseek http client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            http,
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    fn request_for<'a>(&'a self, text: &'a str, target: TargetLanguage) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(target),
                },
                ChatMessage {
                    role: "user",
                    content: text.to_string(),
                },
            ],
            temperature: 0.3,
            stream: false,
        }
    }
}

fn system_prompt(target: TargetLanguage) -> String {
    match target {
        TargetLanguage::Russian => "Ты — аналитик Binance. Переведи или кратко перефразируй текст \
на русский язык, сохранив ключевые факты, числа, тикеры и ссылки. Ответь только текстом перевода."
            .to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_content(resp: ChatResponse) -> Result<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::terminal(Service::Translation, "deepseek returned no content"))
}

/// 408, 429 and 5xx are worth retrying; any other non-success is permanent.
fn classify_status(status: StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("deepseek responded {status}: {snippet}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Error::transient(Service::Translation, message)
    } else {
        Error::terminal(Service::Translation, message)
    }
}

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::transient(Service::Translation, format!("deepseek request error: {e}"))
    } else {
        Error::terminal(Service::Translation, format!("deepseek request error: {e}"))
    }
}

#[async_trait]
impl TranslationPort for DeepSeekClient {
    async fn translate(&self, text: &str, target: TargetLanguage) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        tracing::debug!(model = %self.model, target_language = target.code(), "deepseek chat request");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_for(text, target))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| {
            Error::terminal(Service::Translation, format!("deepseek json error: {e}"))
        })?;
        let content = extract_content(parsed)?;
        tracing::info!(model = %self.model, status = status.as_u16(), "deepseek responded");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        for code in [429u16, 408, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, "").is_transient(), "{code}");
        }
        for code in [400u16, 401, 402, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!classify_status(status, "").is_transient(), "{code}");
        }
    }

    #[test]
    fn error_body_is_truncated() {
        let body = "x".repeat(1000);
        let msg = classify_status(StatusCode::BAD_REQUEST, &body).to_string();
        assert!(msg.len() < 400);
    }

    #[test]
    fn request_body_shape() {
        let client = DeepSeekClient::new("sk", Duration::from_secs(5))
            .unwrap()
            .with_model("deepseek-reasoner");
        let req = client.request_for("Binance Lists XYZ", TargetLanguage::Russian);
        let v = serde_json::to_value(&req).unwrap();

        assert_eq!(v["model"], "deepseek-reasoner");
        assert_eq!(v["stream"], false);
        assert_eq!(v["messages"][0]["role"], "system");
        assert!(v["messages"][0]["content"].as_str().unwrap().contains("русский"));
        assert_eq!(v["messages"][1]["role"], "user");
        assert_eq!(v["messages"][1]["content"], "Binance Lists XYZ");
    }

    #[test]
    fn content_is_extracted_and_trimmed() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"  Binance добавит XYZ \n"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(resp).unwrap(), "Binance добавит XYZ");
    }

    #[test]
    fn empty_choices_are_terminal() {
        let resp: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        let err = extract_content(resp).unwrap_err();
        assert!(matches!(err, Error::Terminal { .. }));

        let resp: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(extract_content(resp).is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = DeepSeekClient::new("sk", Duration::from_secs(5))
            .unwrap()
            .with_base_url("https://proxy.example/");
        assert_eq!(client.base_url, "https://proxy.example");
    }
}
