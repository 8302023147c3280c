//! Notification channel errors.

use thiserror::Error;

/// Errors from webhook delivery.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel has no target configured.
    #[error("channel not configured: {0}")]
    NotConfigured(String),

    /// HTTP transport failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The sink accepted the connection but rejected the payload.
    #[error("webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// All delivery attempts were exhausted.
    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl ChannelError {
    /// Short stable kind string for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "notify_unconfigured",
            Self::Request(_) => "notify_request",
            Self::Rejected { .. } => "notify_rejected",
            Self::Exhausted { .. } => "notify_exhausted",
        }
    }
}
