//! Agent client errors.

use thiserror::Error;

/// Errors from spawning or streaming the agent subprocess.
#[derive(Debug, Error)]
pub enum AmpError {
    /// Could not write the ephemeral settings file.
    #[error("failed to write settings file: {0}")]
    Settings(String),

    /// The subprocess could not be spawned.
    #[error("failed to spawn {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    /// Reading or decoding the output stream failed.
    #[error("stream failure: {0}")]
    Stream(String),

    /// The caller's message callback aborted the run.
    #[error("aborted by callback: {0}")]
    Aborted(String),

    /// The scheduling context was cancelled; the subprocess was killed.
    #[error("cancelled")]
    Cancelled,
}

impl AmpError {
    /// Short stable kind string for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Settings(_) => "agent_settings",
            Self::Spawn { .. } => "agent_spawn",
            Self::Stream(_) => "agent_stream",
            Self::Aborted(_) => "agent_aborted",
            Self::Cancelled => "agent_cancelled",
        }
    }
}
