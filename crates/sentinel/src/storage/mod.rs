//! Persistence contract and adapters.
//!
//! The core consumes the [`Store`] trait and does not own a backend. Two
//! adapters ship here: [`MemoryStore`] (tests, ephemeral runs) and
//! [`FileStore`] (append-only JSONL). Relational backends live outside
//! the workspace and implement the same trait.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entities::{Event, Report, Task};
use crate::error::SentinelError;

/// Task counts by lifecycle state, for the admin surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

/// The capability set the engine depends on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_event(&self, event: &Event) -> Result<(), SentinelError>;
    async fn update_event(&self, event: &Event) -> Result<(), SentinelError>;
    async fn create_task(&self, task: &Task) -> Result<(), SentinelError>;
    async fn update_task(&self, task: &Task) -> Result<(), SentinelError>;
    async fn save_report(&self, report: &Report) -> Result<(), SentinelError>;
    async fn get_report(&self, id: &str) -> Result<Option<Report>, SentinelError>;
    async fn count_tasks_by_status(&self) -> Result<TaskCounts, SentinelError>;

    /// Most recent original report matching `(project_key, fingerprint)`
    /// created at or after `since`. Reuse entries (non-empty
    /// `reused_from_id`) are never returned; only originals are
    /// candidates.
    async fn find_recent_report_by_fingerprint(
        &self,
        project_key: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Report>, SentinelError>;

    async fn close(&self) -> Result<(), SentinelError>;
}
