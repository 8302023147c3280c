//! In-memory store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Store, TaskCounts};
use crate::entities::{Event, Report, Task, TaskStatus};
use crate::error::SentinelError;

/// Process-local store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<HashMap<String, Event>>,
    tasks: RwLock<HashMap<String, Task>>,
    reports: RwLock<HashMap<String, Report>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> SentinelError {
        SentinelError::Store("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_event(&self, event: &Event) -> Result<(), SentinelError> {
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
    use crate::entities::{ConfidenceLabel, QualityScore, Severity};

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            project_key: "svc-a".to_string(),
            payload: serde_json::json!({"error_msg": "boom"}),
            source: "custom".to_string(),
            severity: Severity::Warning,
            title: String::new(),
            received_at: Utc::now(),
        }
    }

    fn report(id: &str, fingerprint: &str, reused_from: &str, age_secs: i64) -> Report {
        Report {
            id: id.to_string(),
            event_id: "e".to_string(),
            project_key: "svc-a".to_string(),
            title: String::new(),
            severity: Severity::Warning,
            has_issue: true,
            confidence: 0.9,
            confidence_label: ConfidenceLabel::High,
            summary: String::new(),
            diagnosis: None,
            quality: QualityScore::default(),
            tainted: false,
            reused_from_id: reused_from.to_string(),
            fingerprint: fingerprint.to_string(),
            revision: String::new(),
            duration_ms: 1,
            session_id: String::new(),
            num_turns: 0,
            input_tokens: 0,
            output_tokens: 0,
            tools_observed: vec![],
            skills_used: vec![],
            prompt_version: "v3".to_string(),
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_task_counts() {
        let store = MemoryStore::new();
        let mut task = Task::new(event("e1"));
        store.create_task(&task).await.unwrap();
        task.status = TaskStatus::Running;
        store.update_task(&task).await.unwrap();

        let counts = store.count_tasks_by_status().await.unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_reuse_lookup_skips_reuse_entries() {
        let store = MemoryStore::new();
        store.save_report(&report("r1", "fp", "", 60)).await.unwrap();
        store
            .save_report(&report("r2", "fp", "r1", 10))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::seconds(3600);
        let found = store
            .find_recent_report_by_fingerprint("svc-a", "fp", since)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "r1");
    }

    #[tokio::test]
    async fn test_reuse_lookup_honors_since() {
        let store = MemoryStore::new();
        store
            .save_report(&report("r1", "fp", "", 7200))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::seconds(3600);
        assert!(store
            .find_recent_report_by_fingerprint("svc-a", "fp", since)
            .await
            .unwrap()
            .is_none());
    }
}
