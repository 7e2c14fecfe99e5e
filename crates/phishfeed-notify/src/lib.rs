//! Outbound run notifications for the collector.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use phishfeed_core::RetryDisposition;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "phishfeed-notify";

/// Tag identifying this collector in every outbound message.
pub const ALERT_PREFIX: &str = "[APWG Feed Collector] ";

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

pub fn tagged(message: &str) -> String {
    format!("{ALERT_PREFIX}{message}")
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("alert request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("alert rejected with http status {status}: {description}")]
    Api { status: u16, description: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        (**self).notify(message).await
    }
}

/// Sends `message`, logging instead of failing when delivery does not work.
pub async fn deliver(notifier: &dyn Notifier, message: &str) {
    if let Err(err) = notifier.notify(message).await {
        warn!(error = %err, alert = message, "alert delivery failed");
    }
}

/// Used when no alert channel is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        info!(alert = %tagged(message), "alert channel not configured; logging only");
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use recording::MemoryNotifier;

#[cfg(any(test, feature = "test-util"))]
mod recording {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{tagged, Notifier, NotifyError};

    /// Keeps every message in memory, in order.
    #[derive(Debug, Default)]
    pub struct MemoryNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl MemoryNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }
    }

    #[async_trait]
    impl Notifier for MemoryNotifier {
        async fn notify(&self, message: &str) -> Result<(), NotifyError> {
            self.messages
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(tagged(message));
            Ok(())
        }
    }
}

/// Flood control and server trouble are worth another try; anything else
/// (bad token, unknown chat, malformed text) will fail the same way again.
pub fn send_disposition(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        status if status.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn transport_disposition(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Telegram's error envelope. `parameters.retry_after` comes with 429 answers.
#[derive(Debug, Default, Deserialize)]
struct ApiReply {
    description: Option<String>,
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyParameters {
    retry_after: Option<u64>,
}

impl ApiReply {
    fn retry_after(&self) -> Option<Duration> {
        self.parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub attempts: u32,
    pub pause: Duration,
    /// Longest wait accepted before giving up on a message.
    pub longest_wait: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_secs(1),
            longest_wait: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    /// Wait before the next attempt, after `failed` attempts. The server's
    /// `retry_after` wins over the doubling pause; `None` means give up.
    pub fn wait_before_retry(&self, failed: u32, retry_after: Option<Duration>) -> Option<Duration> {
        if failed >= self.attempts {
            return None;
        }
        let wait = retry_after.unwrap_or_else(|| {
            let doublings = failed.saturating_sub(1).min(16);
            self.pause.saturating_mul(1 << doublings)
        });
        (wait <= self.longest_wait).then_some(wait)
    }
}

#[derive(Clone)]
pub struct TelegramCredentials {
    pub api_key: String,
    pub chat_id: String,
}

impl fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("api_key", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub credentials: TelegramCredentials,
    pub api_base: String,
    pub timeout: Duration,
    pub delivery: DeliveryPolicy,
}

impl TelegramConfig {
    pub fn new(credentials: TelegramCredentials) -> Self {
        Self {
            credentials,
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            timeout: Duration::from_secs(10),
            delivery: DeliveryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn send_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.credentials.api_key
        )
    }

    async fn send_once(
        &self,
        url: &str,
        text: &str,
    ) -> Result<(), (NotifyError, RetryDisposition, Option<Duration>)> {
        let sent = self
            .client
            .get(url)
            .query(&[
                ("chat_id", self.config.credentials.chat_id.as_str()),
                ("text", text),
            ])
            .send()
            .await;

        // The bot token is part of the URL; keep it out of errors and logs.
        let resp = match sent {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.without_url();
                let disposition = transport_disposition(&err);
                return Err((NotifyError::Request(err), disposition, None));
            }
        };
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let reply: ApiReply = resp.json().await.unwrap_or_default();
        let retry_after = reply.retry_after();
        let err = NotifyError::Api {
            status: status.as_u16(),
            description: reply.description.unwrap_or_else(|| status.to_string()),
        };
        Err((err, send_disposition(status), retry_after))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let text = tagged(message);
        let url = self.send_url();
        let policy = self.config.delivery;

        let mut failed = 0u32;
        loop {
            let (err, disposition, retry_after) = match self.send_once(&url, &text).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };
            failed += 1;
            if disposition == RetryDisposition::NonRetryable {
                return Err(err);
            }
            let Some(wait) = policy.wait_before_retry(failed, retry_after) else {
                return Err(err);
            };
            warn!(attempt = failed, error = %err, wait_ms = wait.as_millis() as u64, "alert not delivered; retrying");
            tokio::time::sleep(wait).await;
        }
    }
}
