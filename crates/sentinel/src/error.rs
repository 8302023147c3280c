//! Error kinds for the diagnosis pipeline.
//!
//! Every failure mode maps to a variant with a short stable kind string
//! used in logs and metrics. The core never panics on user input;
//! configuration validation at startup is the only fatal path.

use thiserror::Error;

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Event references a project the registry does not know.
    #[error("unknown project: {0}")]
    UnknownProject(String),

    /// Severity string outside the accepted set.
    #[error("invalid severity: {0}")]
    InvalidSeverity(String),

    /// Body exceeded the configured cap.
    #[error("payload too large: {size} > {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Body was not parseable JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Fingerprint seen within the suppression window.
    #[error("duplicate within suppression window: {fingerprint}")]
    Duplicate { fingerprint: String },

    /// Project exceeded its hourly admission budget.
    #[error("rate limit exceeded for project {0}")]
    RateLimited(String),

    /// Scheduler queue at capacity or stopped.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Repository snapshot failed.
    #[error("source prepare failed: {0}")]
    SourcePrepare(String),

    /// A git query failed.
    #[error("source command failed: {0}")]
    SourceCommand(String),

    /// Agent subprocess failure (spawn or stream).
    #[error(transparent)]
    Agent(#[from] amp_client::AmpError),

    /// The per-attempt deadline elapsed.
    #[error("diagnosis timed out")]
    Timeout,

    /// Structured output could not be recovered by any layer.
    #[error("structured parse failed: {0}")]
    ParseFailed(String),

    /// Persistence operation failed.
    #[error("store failure: {0}")]
    Store(String),

    /// Internal invariant breach surfaced as a task failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl SentinelError {
    /// Short stable kind string for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownProject(_) => "unknown_project",
            Self::InvalidSeverity(_) => "invalid_severity",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Duplicate { .. } => "duplicate",
            Self::RateLimited(_) => "rate_limited",
            Self::QueueUnavailable(_) => "queue_unavailable",
            Self::SourcePrepare(_) => "source_prepare",
            Self::SourceCommand(_) => "source_command",
            Self::Agent(e) => e.kind(),
            Self::Timeout => "timeout",
            Self::ParseFailed(_) => "parse_failed",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }
}
