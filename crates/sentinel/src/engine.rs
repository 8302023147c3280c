//! The diagnosis engine.
//!
//! Composes everything per task: reuse pre-check, project lock, source
//! snapshot, prompt, agent run, safety verification, structured parse +
//! code-location verification, scoring, report assembly, emission.
//!
//! Lock discipline: steps snapshot→execute→verify→verify-locations run
//! under the project lock; the lock is released explicitly before scoring
//! so arithmetic never serializes projects. Safety verification, store
//! writes and notification run on deadlines independent of the scheduling
//! context, which may already be cancelled.

use std::collections::{BTreeSet, HashMap};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use amp_client::{AgentExecutor, AmpError, ExecuteOptions, ExecuteResult, ServerConfig};
use notify::{Card, CardBuilder, CardTemplate, WebhookNotifier};
use sentinel_config::{Project, SentinelConfig};

use crate::entities::{
    ConfidenceLabel, QualityScore, Report, StructuredDiagnosis, Task, FLAG_SCHEMA_INVALID,
    SCORE_NA,
};
use crate::error::SentinelError;
use crate::fingerprint;
use crate::heuristic;
use crate::parser;
use crate::scheduler::Diagnose;
use crate::scorer::{self, LocationVerification};
use crate::source::SourceManager;
use crate::storage::Store;

/// Deadline for the post-run tree check, independent of the scheduler.
const SAFETY_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for store writes after a diagnosis.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the notification send.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the engine composes.
pub struct DiagnosisEngine {
    config: Arc<SentinelConfig>,
    store: Arc<dyn Store>,
    source: Arc<SourceManager>,
    agent: Arc<dyn AgentExecutor>,
    notifier: Arc<WebhookNotifier>,
    audit_dir: PathBuf,
}

impl DiagnosisEngine {
    #[must_use]
    pub fn new(
        config: Arc<SentinelConfig>,
        store: Arc<dyn Store>,
        source: Arc<SourceManager>,
        agent: Arc<dyn AgentExecutor>,
        notifier: Arc<WebhookNotifier>,
    ) -> Self {
        let audit_dir = PathBuf::from(&config.source.base_dir).join("audit");
        Self {
            config,
            store,
            source,
            agent,
            notifier,
            audit_dir,
        }
    }

    /// Reuse pre-check: lock-free store lookup, then a brief lock to read
    /// the current revision. Store errors mean "no candidate"; reuse must
    /// not add a failure mode.
    async fn try_reuse(&self, task: &Task, fp: &str) -> Option<Report> {
        let diagnosis_config = &self.config.diagnosis;
        if !diagnosis_config.fingerprint_reuse_enabled {
            return None;
        }

        let since = Utc::now()
            - chrono::Duration::from_std(diagnosis_config.fingerprint_reuse_window)
                .unwrap_or_else(|_| chrono::Duration::hours(72));
        let candidate = match self
            .store
            .find_recent_report_by_fingerprint(&task.event.project_key, fp, since)
            .await
        {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "reuse lookup failed, running full diagnosis");
                return None;
            }
        };

        let current_revision = {
            let _guard = self.source.lock(&task.event.project_key).await;
            self.source
                .revision(&task.event.project_key)
                .await
                .unwrap_or_default()
        };

        let (ok, extra_flags) = fingerprint::can_reuse(
            &candidate,
            &current_revision,
            task.event.severity,
            diagnosis_config.fingerprint_reuse_min_score,
        );
        if !ok {
            debug!(candidate = %candidate.id, "reuse candidate rejected");
            return None;
        }

        let mut quality = candidate.quality.clone();
        for flag in &extra_flags {
            quality.add_flag(flag);
        }

        info!(
            task = %task.id,
            original = %candidate.id,
            stale = !extra_flags.is_empty(),
            "serving reused report"
        );
        Some(Report {
            id: format!("rpt-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            event_id: task.event.id.clone(),
            project_key: task.event.project_key.clone(),
            title: task.event.title.clone(),
            severity: task.event.severity,
            has_issue: candidate.has_issue,
            confidence: candidate.confidence,
            confidence_label: candidate.confidence_label,
            summary: candidate.summary.clone(),
            diagnosis: candidate.diagnosis.clone(),
            quality,
            tainted: false,
            reused_from_id: candidate.id.clone(),
            fingerprint: fp.to_string(),
            revision: candidate.revision.clone(),
            duration_ms: 0,
            session_id: String::new(),
            num_turns: 0,
            input_tokens: 0,
            output_tokens: 0,
            tools_observed: Vec::new(),
            skills_used: Vec::new(),
            prompt_version: candidate.prompt_version.clone(),
            created_at: Utc::now(),
            error: None,
        })
    }

    /// Resolve a project's skills through the registry into settings-file
    /// server entries.
    fn resolve_skills(&self, project: &Project) -> HashMap<String, ServerConfig> {
        let mut servers = HashMap::new();
        for skill in &project.skills {
            let Some(entry) = self.config.skills.get(skill) else {
                warn!(skill = %skill, "skill not in registry, skipping");
                continue;
            };
            servers.insert(
                skill.clone(),
                ServerConfig {
                    command: entry.command.clone(),
                    args: entry.args.clone(),
                    env: entry.env.clone(),
                    url: entry.url.clone(),
                    headers: entry.headers.clone(),
                },
            );
        }
        servers
    }

    /// Post-run tree check on an independent deadline. Returns the taint
    /// verdict; a dirty tree is reset best-effort. Errors and timeouts
    /// taint (fail-closed).
    async fn safety_verify(&self, project_key: &str) -> bool {
        let changed = tokio::time::timeout(
            SAFETY_VERIFY_TIMEOUT,
            self.source.has_changes(project_key),
        )
        .await;

        match changed {
            Ok(Ok(false)) => false,
            Ok(Ok(true)) => {
                error!(project = project_key, "working tree modified during diagnosis");
                let reset = tokio::time::timeout(
                    SAFETY_VERIFY_TIMEOUT,
                    self.source.reset_changes(project_key),
                )
                .await;
                match reset {
                    Ok(Ok(())) => info!(project = project_key, "working tree reset"),
                    Ok(Err(e)) => error!(project = project_key, error = %e, "tree reset failed"),
                    Err(_) => error!(project = project_key, "tree reset timed out"),
                }
                true
            }
            Ok(Err(e)) => {
                error!(project = project_key, error = %e, "safety check failed, tainting");
                true
            }
            Err(_) => {
                error!(project = project_key, "safety check timed out, tainting");
                true
            }
        }
    }

    /// Run the agent with the audit-log callback.
    async fn run_agent(
        &self,
        task: &Task,
        project: &Project,
        prompt: &str,
        workdir: PathBuf,
        cancel: CancellationToken,
        skills_used: &mut BTreeSet<String>,
    ) -> Result<ExecuteResult, AmpError> {
        let options = ExecuteOptions {
            workdir,
            mode: None,
            permissions: amp_client::default_rules(),
            servers: self.resolve_skills(project),
            labels: vec![
                format!("project:{}", project.key),
                format!("severity:{}", task.event.severity.as_str()),
            ],
            env: self
                .source
                .git_env()
                .into_iter()
                .collect(),
        };

        let mut audit = self.open_audit_log(&task.id);
        let skill_names = project.skills.clone();
        let mut on_message = |line: &str, message: &amp_client::StreamMessage| {
            if let Some(file) = audit.as_mut() {
                // Best-effort; an unwritable audit log never fails a run.
                let _ = writeln!(file, "{line}");
            }
            for tool in message.tool_names() {
                for skill in &skill_names {
                    if tool.eq_ignore_ascii_case(skill)
                        || tool.to_lowercase().contains(&skill.to_lowercase())
                    {
                        skills_used.insert(skill.clone());
                    }
                }
            }
            Ok(())
        };

        self.agent
            .execute(prompt, options, cancel, &mut on_message)
            .await
    }

    fn open_audit_log(&self, task_id: &str) -> Option<std::fs::File> {
        if let Err(e) = std::fs::create_dir_all(&self.audit_dir) {
            warn!(error = %e, "audit dir unavailable");
            return None;
        }
        let path = self.audit_dir.join(format!("{task_id}.jsonl"));
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "audit log unavailable");
                None
            }
        }
    }

    /// Persist and notify on independent deadlines. Failures are logged
    /// and never block the report.
    async fn emit(&self, project: &Project, report: &Report) {
        let saved = tokio::time::timeout(STORE_TIMEOUT, self.store.save_report(report)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(report = %report.id, error = %e, "report persist failed"),
            Err(_) => error!(report = %report.id, "report persist timed out"),
        }

        let card = build_card(project, report);
        let sent = tokio::time::timeout(
            NOTIFY_TIMEOUT,
            self.notifier.send(&project.notification_target, card),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(report = %report.id, kind = e.kind(), error = %e, "notification failed"),
            Err(_) => warn!(report = %report.id, "notification timed out"),
        }
    }

    fn base_report(&self, task: &Task, fp: &str, revision: &str) -> Report {
        Report {
            id: format!("rpt-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            event_id: task.event.id.clone(),
            project_key: task.event.project_key.clone(),
            title: task.event.title.clone(),
            severity: task.event.severity,
            has_issue: true,
            confidence: 0.0,
            confidence_label: ConfidenceLabel::Low,
            summary: String::new(),
            diagnosis: None,
            quality: QualityScore::default(),
            tainted: false,
            reused_from_id: String::new(),
            fingerprint: fp.to_string(),
            revision: revision.to_string(),
            duration_ms: 0,
            session_id: String::new(),
            num_turns: 0,
            input_tokens: 0,
            output_tokens: 0,
            tools_observed: Vec::new(),
            skills_used: Vec::new(),
            prompt_version: self.config.diagnosis.prompt_version.clone(),
            created_at: Utc::now(),
            error: None,
        }
    }
}

#[async_trait]
impl Diagnose for DiagnosisEngine {
    async fn diagnose(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<Report, SentinelError> {
        let started = Instant::now();
        let event = &task.event;

        let project = self
            .config
            .project(&event.project_key)
            .ok_or_else(|| SentinelError::UnknownProject(event.project_key.clone()))?
            .clone();

        let (fields, is_override) = self.config.dedup_fields(&project);
        let fp = fingerprint::compute(&event.project_key, &event.payload, fields, is_override);

        // Reuse pre-check before taking the main lock.
        if let Some(report) = self.try_reuse(task, &fp).await {
            self.emit(&project, &report).await;
            return Ok(report);
        }

        // Main path: everything touching the tree happens under the lock.
        let lock = self.source.lock(&event.project_key).await;

        let workdir = self.source.prepare(&project).await?;
        let revision = self
            .source
            .revision(&event.project_key)
            .await
            .unwrap_or_default();

        let prompt = crate::prompt::compose(&project, event, &project.skills);
        let mut skills_used = BTreeSet::new();
        let agent_result = self
            .run_agent(task, &project, &prompt, workdir.clone(), cancel, &mut skills_used)
            .await;

        // The subprocess is done (or dead); check the tree regardless of
        // how the run ended, on an independent deadline.
        let tainted = self.safety_verify(&event.project_key).await;

        let agent_result = match agent_result {
            Ok(result) => result,
            Err(e) => {
                // Spawn/stream failures and cancellation surface to the
                // scheduler after cleanup; the lock releases on drop.
                drop(lock);
                return Err(SentinelError::Agent(e));
            }
        };

        let mut report = self.base_report(task, &fp, &revision);
        report.tainted = tainted;
        report.session_id = agent_result.session_id.clone();
        report.num_turns = agent_result.num_turns;
        report.input_tokens = agent_result.input_tokens;
        report.output_tokens = agent_result.output_tokens;
        report.tools_observed = agent_result.tool_names.iter().cloned().collect();
        report.skills_used = skills_used.into_iter().collect();

        if agent_result.is_error {
            // The agent itself reported failure: synthesize a
            // low-confidence report rather than retrying.
            drop(lock);
            report.summary = format!("diagnosis failed: {}", agent_result.error);
            report.confidence = 0.1;
            report.confidence_label = ConfidenceLabel::Low;
            report.error = Some(agent_result.error.clone());
            report.quality.code_verify = SCORE_NA;
            report.quality.non_code_path = SCORE_NA;
            scorer::finalize(&mut report.quality);
            report.duration_ms = started.elapsed().as_millis() as u64;
            self.emit(&project, &report).await;
            return Ok(report);
        }

        // Structured parse while still holding the lock (location
        // verification reads the tree), then release before scoring.
        let parsed = if self.config.diagnosis.structured_output {
            let fixer: Option<&dyn AgentExecutor> = if self.config.diagnosis.json_fixer_enabled {
                Some(self.agent.as_ref())
            } else {
                None
            };
            parser::parse_with_repair(&agent_result.text, fixer).await
        } else {
            Err(SentinelError::ParseFailed("structured output disabled".to_string()))
        };

        match parsed {
            Ok(diagnosis) => {
                let verification = if diagnosis.code_locations.is_empty() {
                    None
                } else {
                    Some(scorer::verify_locations(&workdir, &diagnosis.code_locations))
                };
                drop(lock);
                self.finish_structured(task, &project, report, diagnosis, verification, started)
                    .await
            }
            Err(parse_error) => {
                drop(lock);
                if self.config.diagnosis.structured_output {
                    warn!(task = %task.id, error = %parse_error, "falling back to heuristics");
                }
                self.finish_heuristic(&project, report, &agent_result.text, started)
                    .await
            }
        }
    }
}

impl DiagnosisEngine {
    async fn finish_structured(
        &self,
        task: &Task,
        project: &Project,
        mut report: Report,
        diagnosis: StructuredDiagnosis,
        verification: Option<LocationVerification>,
        started: Instant,
    ) -> Result<Report, SentinelError> {
        report.quality = scorer::score(&diagnosis, verification.as_ref());
        report.has_issue = diagnosis.conclusion.has_issue;
        report.confidence = diagnosis.conclusion.confidence;
        report.confidence_label = diagnosis.conclusion.confidence_label;
        report.summary = diagnosis.summary.clone();
        report.diagnosis = Some(diagnosis);
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            task = %task.id,
            report = %report.id,
            has_issue = report.has_issue,
            score = report.quality.normalized,
            tainted = report.tainted,
            "diagnosis complete"
        );
        self.emit(project, &report).await;
        Ok(report)
    }

    async fn finish_heuristic(
        &self,
        project: &Project,
        mut report: Report,
        text: &str,
        started: Instant,
    ) -> Result<Report, SentinelError> {
        let verdict = heuristic::detect(text);
        report.has_issue = verdict.has_issue;
        report.confidence = verdict.confidence;
        report.confidence_label = verdict.confidence_label;
        report.summary = verdict.summary;
        report.quality.code_verify = SCORE_NA;
        report.quality.non_code_path = SCORE_NA;
        if self.config.diagnosis.structured_output {
            report.quality.add_flag(FLAG_SCHEMA_INVALID);
        }
        scorer::finalize(&mut report.quality);
        report.duration_ms = started.elapsed().as_millis() as u64;

        self.emit(project, &report).await;
        Ok(report)
    }
}

/// Map a report onto a notification card.
#[must_use]
pub fn build_card(project: &Project, report: &Report) -> Card {
    let template = if report.tainted {
        CardTemplate::Purple
    } else if !report.has_issue {
        CardTemplate::Yellow
    } else if report.confidence_label == ConfidenceLabel::High {
        CardTemplate::Red
    } else {
        CardTemplate::Orange
    };

    let title = if report.title.is_empty() {
        format!("Diagnosis for {}", project.name_or_key())
    } else {
        report.title.clone()
    };

    let mut builder = CardBuilder::new(title, template)
        .field("Project", project.name_or_key())
        .field("Severity", report.severity.as_str())
        .field(
            "Verdict",
            &format!(
                "{} ({} confidence {:.2})",
                if report.has_issue { "issue found" } else { "no issue" },
                report.confidence_label.as_str(),
                report.confidence
            ),
        )
        .field("Quality", &format!("{}/100", report.quality.normalized));

    if !report.revision.is_empty() {
        builder = builder.field("Revision", &report.revision);
    }
    if !report.reused_from_id.is_empty() {
        builder = builder.field("Reused from", &report.reused_from_id);
    }
    if report.tainted {
        builder = builder.field("Safety", "source tree was modified during diagnosis");
    }
    if !report.summary.is_empty() {
        builder = builder.divider().markdown(report.summary.clone());
    }
    if let Some(diagnosis) = &report.diagnosis {
        if let Some(cause) = diagnosis.root_causes.first() {
            builder = builder.markdown(format!("**Top hypothesis:** {}", cause.hypothesis));
        }
        if let Some(remediation) = diagnosis.remediations.first() {
            builder = builder.markdown(format!("**Remediation:** {remediation}"));
        }
    }
    if !project.owners.is_empty() {
        builder = builder.field("Owners", &project.owners.join(", "));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Severity;

    fn project() -> Project {
        Project {
            key: "svc-a".to_string(),
            name: "Service A".to_string(),
            repo_url: "u".to_string(),
            branch: "main".to_string(),
            language: String::new(),
            source_root: String::new(),
            skills: vec![],
            owners: vec!["@oncall".to_string()],
            notification_target: String::new(),
            dedup: None,
        }
    }

    fn report() -> Report {
        Report {
            id: "rpt-1".to_string(),
            event_id: "evt-1".to_string(),
            project_key: "svc-a".to_string(),
            title: "NPE spike".to_string(),
            severity: Severity::Critical,
            has_issue: true,
            confidence: 0.9,
            confidence_label: ConfidenceLabel::High,
            summary: "null deref in handler".to_string(),
            diagnosis: None,
            quality: QualityScore::default(),
            tainted: false,
            reused_from_id: String::new(),
            fingerprint: "fp".to_string(),
            revision: "abc1234".to_string(),
            duration_ms: 1000,
            session_id: String::new(),
            num_turns: 0,
            input_tokens: 0,
            output_tokens: 0,
            tools_observed: vec![],
            skills_used: vec![],
            prompt_version: "v3".to_string(),
            created_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn test_card_template_selection() {
        let project = project();

        let high = report();
        assert_eq!(build_card(&project, &high).template(), CardTemplate::Red);

        let mut medium = report();
        medium.confidence = 0.6;
        medium.confidence_label = ConfidenceLabel::Medium;
        assert_eq!(build_card(&project, &medium).template(), CardTemplate::Orange);

        let mut clean = report();
        clean.has_issue = false;
        assert_eq!(build_card(&project, &clean).template(), CardTemplate::Yellow);

        // Tainted wins over everything else.
        let mut tainted = report();
        tainted.tainted = true;
        assert_eq!(build_card(&project, &tainted).template(), CardTemplate::Purple);
    }

    #[test]
    fn test_card_carries_reuse_pointer() {
        let mut reused = report();
        reused.reused_from_id = "rpt-0".to_string();
        let card = build_card(&project(), &reused);
        let value = serde_json::to_value(&card).unwrap();
        let text = value.to_string();
        assert!(text.contains("rpt-0"));
    }
}
