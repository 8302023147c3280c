//! Append-only file store.
//!
//! One JSONL file per collection under the data directory. Every create,
//! update and save appends a full record; the newest line for an id wins.
//! The in-memory index is rebuilt by replaying the files at open, so a
//! crash mid-append loses at most the partial last line (skipped on
//! replay).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tracing::warn;

use super::{Store, TaskCounts};
use crate::entities::{Event, Report, Task, TaskStatus};
use crate::error::SentinelError;

const EVENTS_FILE: &str = "events.jsonl";
const TASKS_FILE: &str = "tasks.jsonl";
const REPORTS_FILE: &str = "reports.jsonl";

/// JSONL-backed store.
pub struct FileStore {
    dir: PathBuf,
    events: RwLock<HashMap<String, Event>>,
    tasks: RwLock<HashMap<String, Task>>,
    reports: RwLock<HashMap<String, Report>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`, replaying existing files.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, SentinelError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SentinelError::Store(format!("create {}: {e}", dir.display())))?;

        let events = replay(&dir.join(EVENTS_FILE), |e: &Event| e.id.clone()).await?;
        let tasks = replay(&dir.join(TASKS_FILE), |t: &Task| t.id.clone()).await?;
        let reports = replay(&dir.join(REPORTS_FILE), |r: &Report| r.id.clone()).await?;

        Ok(Self {
            dir,
            events: RwLock::new(events),
            tasks: RwLock::new(tasks),
            reports: RwLock::new(reports),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<(), SentinelError> {
        let line = serde_json::to_string(record)
            .map_err(|e| SentinelError::Store(format!("serialize: {e}")))?;
        let path = self.dir.join(file);

        let _guard = self.write_lock.lock().await;
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SentinelError::Store(format!("open {}: {e}", path.display())))?;
        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SentinelError::Store(format!("append {}: {e}", path.display())))?;
        handle
            .write_all(b"\n")
            .await
            .map_err(|e| SentinelError::Store(format!("append {}: {e}", path.display())))?;
        handle
            .flush()
            .await
            .map_err(|e| SentinelError::Store(format!("flush {}: {e}", path.display())))?;
        Ok(())
    }

    fn poisoned() -> SentinelError {
        SentinelError::Store("file store index lock poisoned".to_string())
    }
}

/// Rebuild one collection index from its JSONL file.
async fn replay<T: DeserializeOwned>(
    path: &Path,
    key: impl Fn(&T) -> String,
) -> Result<HashMap<String, T>, SentinelError> {
    let mut index = HashMap::new();
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => {
            return Err(SentinelError::Store(format!(
                "read {}: {e}",
                path.display()
            )))
        }
    };

    for (number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => {
                index.insert(key(&record), record);
            }
            Err(e) => {
                // Torn tail line after a crash; anything else is worth a look.
                warn!(file = %path.display(), line = number + 1, error = %e, "skipping bad record");
            }
        }
    }
    Ok(index)
}

#[async_trait]
impl Store for FileStore {
    async fn create_event(&self, event: &Event) -> Result<(), SentinelError> {
        self.append(EVENTS_FILE, event).await?;
        self.events
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn update_event(&self, event: &Event) -> Result<(), SentinelError> {
        self.create_event(event).await
    }

    async fn create_task(&self, task: &Task) -> Result<(), SentinelError> {
        self.append(TASKS_FILE, task).await?;
        self.tasks
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), SentinelError> {
        self.create_task(task).await
    }

    async fn save_report(&self, report: &Report) -> Result<(), SentinelError> {
        self.append(REPORTS_FILE, report).await?;
        self.reports
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(report.id.clone(), report.clone());
        Ok(())
    }

    async fn get_report(&self, id: &str) -> Result<Option<Report>, SentinelError> {
        Ok(self
            .reports
            .read()
            .map_err(|_| Self::poisoned())?
            .get(id)
            .cloned())
    }

    async fn count_tasks_by_status(&self) -> Result<TaskCounts, SentinelError> {
        let tasks = self.tasks.read().map_err(|_| Self::poisoned())?;
        let mut counts = TaskCounts::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn find_recent_report_by_fingerprint(
        &self,
        project_key: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Report>, SentinelError> {
        let reports = self.reports.read().map_err(|_| Self::poisoned())?;
        Ok(reports
            .values()
            .filter(|r| {
                r.project_key == project_key
                    && r.fingerprint == fingerprint
                    && r.reused_from_id.is_empty()
                    && r.created_at >= since
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn close(&self) -> Result<(), SentinelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Severity;

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            project_key: "svc-a".to_string(),
            payload: serde_json::json!({"error_msg": "boom"}),
            source: "custom".to_string(),
            severity: Severity::Info,
            title: String::new(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            let mut task = Task::new(event("e1"));
            store.create_task(&task).await.unwrap();
            task.status = TaskStatus::Completed;
            store.update_task(&task).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let counts = store.count_tasks_by_status().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_torn_tail_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.create_event(&event("e1")).await.unwrap();
        }
        // Simulate a crash mid-append.
        let path = dir.path().join(EVENTS_FILE);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"id\":\"e2\",\"proj");
        std::fs::write(&path, raw).unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        store.create_event(&event("e3")).await.unwrap();
        let events = store.events.read().unwrap();
        assert!(events.contains_key("e1"));
        assert!(events.contains_key("e3"));
        assert!(!events.contains_key("e2"));
    }
}
