//! Odesílání ven. Telegram Bot API `sendMessage`, HTML parse mode.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("send timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },
    #[error("rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Timeout | DeliveryError::Transport(_) | DeliveryError::RateLimited { .. } => true,
            DeliveryError::Rejected { status, .. } => *status >= 500,
        }
    }

    /// Minimální pauza před dalším pokusem, kterou si řekl server
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after: Some(secs) } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, chat: &str, text: &str) -> Result<(), DeliveryError>;
}

pub struct TelegramSender {
    client:   reqwest::Client,
    token:    String,
    api_base: String,
}

impl TelegramSender {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(format!("http client build failed: {e}")))?;
        Ok(Self { client, token: token.into(), api_base: TELEGRAM_API.to_string() })
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

/// Číselné chat id posíláme jako číslo, `@kanal` jako string
pub fn chat_id_value(chat: &str) -> Value {
    match chat.trim().parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(chat.trim()),
    }
}

#[async_trait]
impl AlertSender for TelegramSender {
    async fn send(&self, chat: &str, text: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.token);
        let body = json!({
            "chat_id": chat_id_value(chat),
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            debug!("telegram: sent to {chat}");
            return Ok(());
        }

        let raw = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            let retry_after = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| v.pointer("/parameters/retry_after").and_then(|r| r.as_u64()));
            return Err(DeliveryError::RateLimited { retry_after });
        }
        Err(DeliveryError::Rejected { status: status.as_u16(), body: raw.chars().take(200).collect() })
    }
}
