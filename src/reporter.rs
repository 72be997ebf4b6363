//! Operator channel for failures that need a human (dead session cookies,
//! misbehaving upstream APIs, failed publishes).

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;

/// Longest message body forwarded to a webhook; longer reports are cut.
const MESSAGE_LIMIT: usize = 2000;

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Deliver `message`. Delivery failures are logged, never returned.
    async fn report(&self, message: &str);
}

/// Logs reports at error level and nothing else.
pub struct TracingReporter;

#[async_trait]
impl Reporter for TracingReporter {
    async fn report(&self, message: &str) {
        tracing::error!("{}", message);
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
    truncated: bool,
}

/// Logs and forwards reports to a JSON webhook.
pub struct WebhookReporter {
    http_client: HttpClient,
    url: String,
}

impl WebhookReporter {
    pub fn new(http_client: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http_client,
            url: url.into(),
        }
    }
}

fn truncate(message: &str) -> (&str, bool) {
    if message.len() <= MESSAGE_LIMIT {
        return (message, false);
    }
    let mut end = MESSAGE_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    (&message[..end], true)
}

#[async_trait]
impl Reporter for WebhookReporter {
    async fn report(&self, message: &str) {
        tracing::error!("{}", message);

        let (text, truncated) = truncate(message);
        let result = self
            .http_client
            .post(&self.url)
            .json(&WebhookPayload { text, truncated })
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        if let Err(e) = result {
            tracing::warn!("Unable to deliver report to webhook: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_messages_pass_through() {
        assert_eq!(truncate("cookie is dead"), ("cookie is dead", false));
    }

    #[test]
    fn test_long_messages_are_cut_on_char_boundary() {
        let message = "é".repeat(MESSAGE_LIMIT);
        let (text, truncated) = truncate(&message);
        assert!(truncated);
        assert!(text.len() <= MESSAGE_LIMIT);
        assert!(text.chars().all(|c| c == 'é'));
    }
}
