//! Webhook notifications for diagnosis reports.
//!
//! One sink type: an HTTP webhook that accepts interactive-card JSON.
//! Delivery is retried with linear backoff; failures are surfaced to the
//! caller, which logs and moves on. A report is never blocked on its
//! notification.
//!
//! ```no_run
//! use notify::{CardBuilder, CardTemplate, WebhookNotifier};
//!
//! # async fn demo() -> Result<(), notify::ChannelError> {
//! let notifier = WebhookNotifier::new(None, 3, std::time::Duration::from_secs(2));
//! let card = CardBuilder::new("NPE in svc-a", CardTemplate::Red)
//!     .field("Project", "svc-a")
//!     .build();
//! notifier.send("https://hooks.example.com/abc", card).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod card;
pub mod error;

pub use card::{Card, CardBuilder, CardElement, CardTemplate};
pub use error::ChannelError;

use std::time::Duration;

use tracing::{debug, warn};

/// Webhook delivery with retry.
pub struct WebhookNotifier {
    client: reqwest::Client,
    secret: Option<String>,
    retry_count: u32,
    retry_delay: Duration,
}

impl WebhookNotifier {
    /// Create a notifier. `secret` enables signed mode for every send.
    #[must_use]
    pub fn new(secret: Option<String>, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret: secret.filter(|s| !s.is_empty()),
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    /// Whether signed mode is active.
    #[must_use]
    pub fn signing(&self) -> bool {
        self.secret.is_some()
    }

    /// Deliver a card to `target_url`, retrying with linear backoff.
    ///
    /// Attempt N sleeps `N * retry_delay` before retrying. The signature
    /// is recomputed per attempt so the timestamp stays fresh.
    pub async fn send(&self, target_url: &str, card: Card) -> Result<(), ChannelError> {
        if target_url.is_empty() {
            return Err(ChannelError::NotConfigured(
                "notification_target".to_string(),
            ));
        }

        let mut last_error = String::new();
        for attempt in 1..=self.retry_count {
            let payload = match &self.secret {
                Some(secret) => card
                    .clone()
                    .signed(secret, chrono::Utc::now().timestamp()),
                None => card.clone(),
            };

            match self.try_send(target_url, &payload).await {
                Ok(()) => {
                    debug!(target = target_url, attempt, "notification delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target = target_url,
                        attempt,
                        error = %e,
                        "notification attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.retry_count {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        Err(ChannelError::Exhausted {
            attempts: self.retry_count,
            last: last_error,
        })
    }

    async fn try_send(&self, target_url: &str, card: &Card) -> Result<(), ChannelError> {
        let response = self.client.post(target_url).json(card).send().await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ChannelError::Rejected { status, body })
    }
}
