//! Engine pipeline scenarios: fresh diagnosis, reuse, taint handling,
//! repair fallback, hallucinated locations, agent errors.
//!
//! The agent is a scripted stub; source trees are real git repositories
//! in temp directories. Tests that need the git binary skip when it is
//! absent.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use amp_client::{AgentExecutor, AmpError, ExecuteOptions, ExecuteResult, OnMessage};
use notify::WebhookNotifier;
use sentinel_config::SentinelConfig;

use sentinel::entities::{Event, Severity, Task};
use sentinel::{Diagnose, DiagnosisEngine, MemoryStore, SourceManager, Store};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(dir)
        .args([
            "-c",
            "user.email=test@example.com",
            "-c",
            "user.name=test",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .status()
        .expect("git runs");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// Create an origin repository containing `Foo.java` with 60 lines.
fn init_origin(dir: &Path) -> String {
    git(dir, &["init", "-b", "main"]);
    let mut content = String::new();
    for i in 1..=60 {
        content.push_str(&format!("// line {i}\n"));
    }
    std::fs::write(dir.join("Foo.java"), content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "init"]);
    format!("file://{}", dir.display())
}

fn config_yaml(repo_url: &str, base_dir: &Path) -> SentinelConfig {
    let yaml = format!(
        r"
scheduler:
  max_concurrency: 1
diagnosis:
  json_fixer_enabled: false
  fingerprint_reuse_min_score: 60
source:
  base_dir: {base}
projects:
  - key: svc-a
    name: Service A
    repo_url: {repo_url}
    branch: main
",
        base = base_dir.display()
    );
    SentinelConfig::from_yaml(&yaml).unwrap()
}

/// Scripted agent: fixed output text, optional tree mutation, call count.
struct ScriptedAgent {
    text: Mutex<String>,
    is_error: bool,
    mutate_file: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    fn new(text: &str) -> Self {
        Self {
            text: Mutex::new(text.to_string()),
            is_error: false,
            mutate_file: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(
        &self,
        _prompt: &str,
        options: ExecuteOptions,
        _cancel: CancellationToken,
        on_message: OnMessage<'_>,
    ) -> Result<ExecuteResult, AmpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(name) = &self.mutate_file {
            std::fs::write(options.workdir.join(name), "mutated").unwrap();
        }

        let text = self.text.lock().unwrap().clone();
        let line = format!(
            r#"{{"type":"result","result":{},"is_error":{}}}"#,
            serde_json::to_string(&text).unwrap(),
            self.is_error
        );
        let message = amp_client::StreamMessage::decode(&line).unwrap();
        on_message(&line, &message).map_err(AmpError::Aborted)?;

        Ok(ExecuteResult {
            session_id: "sess-1".to_string(),
            text,
            is_error: self.is_error,
            error: if self.is_error {
                "agent exploded".to_string()
            } else {
                String::new()
            },
            duration: std::time::Duration::from_millis(5),
            num_turns: 2,
            input_tokens: 100,
            output_tokens: 50,
            tool_names: ["Read".to_string()].into_iter().collect(),
        })
    }
}

fn diagnosis_json(file: &str, line: u64) -> String {
    format!(
        r#"```json
{{
  "summary": "NPE in request handler",
  "conclusion": {{"has_issue": true, "confidence": 0.9, "confidence_label": "high"}},
  "root_causes": [{{
    "rank": 1,
    "hypothesis": "unchecked null dereference",
    "evidence": [
      {{"type": "code", "detail": "dereference without guard", "file": "{file}",
        "line_start": {line}, "line_end": {line}}},
      {{"type": "log", "detail": "NullPointerException stack trace in app log"}}
    ],
    "verification_steps": ["replay the failing request"]
  }}],
  "code_locations": [{{"file": "{file}", "line_start": {line}, "line_end": {line},
                      "reason": "dereference site"}}],
  "remediations": ["guard the dereference before accessing the user session"]
}}
```"#
    )
}

fn event(id: &str, severity: Severity) -> Event {
    Event {
        id: id.to_string(),
        project_key: "svc-a".to_string(),
        payload: serde_json::json!({"error_msg": "NPE at Foo.java:42"}),
        source: "custom".to_string(),
        severity,
        title: "NPE spike".to_string(),
        received_at: Utc::now(),
    }
}

struct Harness {
    _origin: tempfile::TempDir,
    _base: tempfile::TempDir,
    store: Arc<MemoryStore>,
    engine: DiagnosisEngine,
    agent: Arc<ScriptedAgent>,
}

fn harness(agent: ScriptedAgent) -> Harness {
    let origin = tempfile::tempdir().unwrap();
    let base = tempfile::tempdir().unwrap();
    let repo_url = init_origin(origin.path());
    let config = Arc::new(config_yaml(&repo_url, base.path()));

    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(SourceManager::new(base.path(), None));
    let agent = Arc::new(agent);
    let notifier = Arc::new(WebhookNotifier::new(
        None,
        1,
        std::time::Duration::from_millis(1),
    ));

    let engine = DiagnosisEngine::new(
        config,
        Arc::clone(&store) as Arc<dyn Store>,
        source,
        Arc::clone(&agent) as Arc<dyn AgentExecutor>,
        notifier,
    );
    Harness {
        _origin: origin,
        _base: base,
        store,
        engine,
        agent,
    }
}

#[tokio::test]
async fn test_fresh_critical_high_confidence_issue() {
    if !git_available() {
        return;
    }
    let h = harness(ScriptedAgent::new(&diagnosis_json("Foo.java", 42)));

    let task = Task::new(event("evt-1", Severity::Critical));
    let report = h.engine.diagnose(&task, CancellationToken::new()).await.unwrap();

    assert!(report.has_issue);
    assert_eq!(report.confidence_label.as_str(), "high");
    assert!(!report.tainted);
    assert!(report.quality.normalized >= 90, "got {}", report.quality.normalized);
    assert!(!report.revision.is_empty());
    assert!(!report.fingerprint.is_empty());
    assert_eq!(report.session_id, "sess-1");
    assert!(report.tools_observed.contains(&"Read".to_string()));

    // Persisted and retrievable.
    let stored = h.store.get_report(&report.id).await.unwrap().unwrap();
    assert_eq!(stored.quality.normalized, report.quality.normalized);
}

#[tokio::test]
async fn test_recurring_fingerprint_is_reused() {
    if !git_available() {
        return;
    }
    let h = harness(ScriptedAgent::new(&diagnosis_json("Foo.java", 42)));

    let first = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.agent.calls(), 1);

    let second = h
        .engine
        .diagnose(&Task::new(event("evt-2", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();

    // Served from reuse: no second agent run.
    assert_eq!(h.agent.calls(), 1);
    assert_eq!(second.duration_ms, 0);
    assert_eq!(second.reused_from_id, first.id);
    assert_eq!(
        serde_json::to_value(second.diagnosis.as_ref().unwrap()).unwrap(),
        serde_json::to_value(first.diagnosis.as_ref().unwrap()).unwrap()
    );
    assert_eq!(second.fingerprint, first.fingerprint);
}

#[tokio::test]
async fn test_reuse_rejected_for_critical_on_stale_revision() {
    if !git_available() {
        return;
    }
    let h = harness(ScriptedAgent::new(&diagnosis_json("Foo.java", 42)));

    let first = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();

    // Pretend the original ran on an older commit.
    let mut stale = first.clone();
    stale.revision = "0000000".to_string();
    h.store.save_report(&stale).await.unwrap();

    // Warning severity accepts the stale candidate, flagged.
    let reused = h
        .engine
        .diagnose(&Task::new(event("evt-2", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.agent.calls(), 1);
    assert!(!reused.reused_from_id.is_empty());
    assert!(reused.quality.has_flag("reused_stale_commit"));

    // Critical severity refuses it and pays full price.
    h.engine
        .diagnose(&Task::new(event("evt-3", Severity::Critical)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.agent.calls(), 2);
}

#[tokio::test]
async fn test_tree_mutation_taints_and_resets() {
    if !git_available() {
        return;
    }
    let mut agent = ScriptedAgent::new(&diagnosis_json("Foo.java", 42));
    agent.mutate_file = Some("EVIL.txt".to_string());
    let h = harness(agent);

    let report = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.tainted);

    // The untracked file was cleaned away.
    let checkout = h._base.path().join("svc-a");
    assert!(!checkout.join("EVIL.txt").exists());

    // A tainted report is never served from reuse.
    h.engine
        .diagnose(&Task::new(event("evt-2", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.agent.calls(), 2);
}

#[tokio::test]
async fn test_trailing_commas_are_repaired_without_flag() {
    if !git_available() {
        return;
    }
    let broken = r#"{"summary":"x", "conclusion":{"has_issue":true,"confidence":0.9,"confidence_label":"high"}, "root_causes":[{"rank":1,"hypothesis":"stale cache",},],}"#;
    let h = harness(ScriptedAgent::new(broken));

    let report = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.diagnosis.is_some());
    assert!(!report.quality.has_flag("schema_invalid"));
    assert!(report.has_issue);
}

#[tokio::test]
async fn test_hallucinated_location_scores_zero_code_verify() {
    if !git_available() {
        return;
    }
    let h = harness(ScriptedAgent::new(&diagnosis_json("Bar.java", 10)));

    let report = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.quality.code_verify, 0);
    assert!(report.quality.has_flag("hallucinated_file"));
    // The report still lands in the store.
    assert!(h.store.get_report(&report.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_agent_error_synthesizes_low_confidence_report() {
    if !git_available() {
        return;
    }
    let mut agent = ScriptedAgent::new("");
    agent.is_error = true;
    let h = harness(agent);

    let report = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.confidence_label.as_str(), "low");
    assert!(report.error.is_some());
    assert!(report.summary.contains("agent exploded"));
}

#[tokio::test]
async fn test_unparseable_output_falls_back_to_heuristics() {
    if !git_available() {
        return;
    }
    let h = harness(ScriptedAgent::new(
        "I could not produce JSON but the root cause is clearly a race condition.",
    ));

    let report = h
        .engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.quality.has_flag("schema_invalid"));
    assert!(report.has_issue);
    assert!(report.diagnosis.is_none());
    assert_eq!(report.quality.normalized, 0);
}

#[tokio::test]
async fn test_unknown_project_fails_fast() {
    let store = Arc::new(MemoryStore::new());
    let base = tempfile::tempdir().unwrap();
    let config = Arc::new(
        SentinelConfig::from_yaml(&format!(
            "source:\n  base_dir: {}\n",
            base.path().display()
        ))
        .unwrap(),
    );
    let engine = DiagnosisEngine::new(
        config,
        store as Arc<dyn Store>,
        Arc::new(SourceManager::new(base.path(), None)),
        Arc::new(ScriptedAgent::new("")) as Arc<dyn AgentExecutor>,
        Arc::new(WebhookNotifier::new(None, 1, std::time::Duration::from_millis(1))),
    );

    let err = engine
        .diagnose(&Task::new(event("evt-1", Severity::Warning)), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_project");
}
