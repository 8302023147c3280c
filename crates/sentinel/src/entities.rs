//! Core domain types: events, tasks, diagnoses, scores, reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation as _;

/// Maximum graphemes kept in a diagnosis summary.
pub const SUMMARY_MAX_GRAPHEMES: usize = 200;

/// Maximum graphemes kept in an extracted event title.
pub const TITLE_MAX_GRAPHEMES: usize = 100;

// Flags attached to quality scores and reports.
pub const FLAG_SCHEMA_INVALID: &str = "schema_invalid";
pub const FLAG_HALLUCINATED_FILE: &str = "hallucinated_file";
pub const FLAG_HALLUCINATED_LINE: &str = "hallucinated_line";
pub const FLAG_NO_EVIDENCE: &str = "no_evidence";
pub const FLAG_HIGH_CONF_NO_SUPPORT: &str = "high_conf_no_support";
pub const FLAG_EMPTY_REMEDIATION: &str = "empty_remediation";
pub const FLAG_AUTO_FIXED_EVIDENCE: &str = "auto_fixed_evidence_type";
pub const FLAG_REUSED_STALE_COMMIT: &str = "reused_stale_commit";
pub const FLAG_INSUFFICIENT_INFO: &str = "insufficient_information";

/// Event severity, ordered `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Scheduler priority: critical=100, warning=50, info=10.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Critical => 100,
            Self::Warning => 50,
            Self::Info => 10,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    /// Parse a severity name. Unknown names are rejected at intake.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

/// A raw failure event. Created by intake, frozen thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub project_key: String,
    /// Opaque monitor payload.
    pub payload: serde_json::Value,
    pub source: String,
    pub severity: Severity,
    #[serde(default)]
    pub title: String,
    pub received_at: DateTime<Utc>,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A scheduled diagnosis. Created on admission; mutated only by the worker
/// executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub event: Event,
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// New pending task for an event.
    #[must_use]
    pub fn new(event: Event) -> Self {
        let priority = event.severity.priority();
        Self {
            id: format!("task-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            event,
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Confidence label, kept consistent with the numeric confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

impl ConfidenceLabel {
    /// Label derived from the numeric confidence. The numeric value is
    /// authoritative; a mismatched label is corrected from it.
    #[must_use]
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Self::High
        } else if confidence >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Evidence classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceType {
    Code,
    Log,
    Stack,
    Config,
}

/// One piece of evidence under a root cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "type")]
    pub kind: EvidenceType,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u64>,
}

/// A ranked root-cause hypothesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCause {
    pub rank: u32,
    pub hypothesis: String,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub counter_evidence: Vec<String>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
}

/// Verdict block of a diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conclusion {
    pub has_issue: bool,
    pub confidence: f64,
    pub confidence_label: ConfidenceLabel,
}

/// A file/line range the diagnosis points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file: String,
    #[serde(default)]
    pub line_start: u64,
    #[serde(default)]
    pub line_end: u64,
    #[serde(default)]
    pub reason: String,
}

/// The structured output the agent is asked to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredDiagnosis {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub summary: String,
    pub conclusion: Conclusion,
    #[serde(default)]
    pub root_causes: Vec<RootCause>,
    #[serde(default)]
    pub code_locations: Vec<CodeLocation>,
    #[serde(default)]
    pub remediations: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub non_code_factors: Vec<String>,
    /// Self-declared marker: the payload did not carry enough signal.
    #[serde(default)]
    pub insufficient_information: bool,
    /// Evidence type strings coerced during validation. Internal; not
    /// part of the wire schema.
    #[serde(skip)]
    pub auto_fixed_evidence_types: Vec<String>,
}

fn default_schema_version() -> String {
    "1".to_string()
}

impl StructuredDiagnosis {
    /// Total evidence items across all root causes.
    #[must_use]
    pub fn evidence_count(&self) -> usize {
        self.root_causes.iter().map(|c| c.evidence.len()).sum()
    }

    /// Whether any evidence is of the given type.
    #[must_use]
    pub fn has_evidence_of(&self, kind: EvidenceType) -> bool {
        self.root_causes
            .iter()
            .flat_map(|c| &c.evidence)
            .any(|e| e.kind == kind)
    }
}

/// Sentinel for score dimensions that do not apply.
pub const SCORE_NA: i32 = -1;

/// Six-dimension quality score with a dynamic denominator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityScore {
    pub schema: i32,
    pub evidence: i32,
    /// `-1` when not applicable.
    pub code_verify: i32,
    pub coherence: i32,
    pub actionable: i32,
    /// `-1` when not applicable.
    pub non_code_path: i32,
    #[serde(default)]
    pub flags: Vec<String>,
    pub max_possible: u32,
    /// `floor(sum(applicable) * 100 / sum(applicable maxima))`.
    pub normalized: u32,
}

impl QualityScore {
    /// Append a flag if not already present.
    pub fn add_flag(&mut self, flag: &str) {
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
    }

    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// The assembled outcome of one diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub event_id: String,
    pub project_key: String,
    #[serde(default)]
    pub title: String,
    pub severity: Severity,
    pub has_issue: bool,
    pub confidence: f64,
    pub confidence_label: ConfidenceLabel,
    #[serde(default)]
    pub summary: String,
    /// Present on the structured path; absent on heuristic-only reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<StructuredDiagnosis>,
    pub quality: QualityScore,
    /// Set when a safety-check failure or an unexplained tree modification
    /// was observed; a tainted report is never reused.
    #[serde(default)]
    pub tainted: bool,
    /// Id of the original report when this one was served from reuse.
    #[serde(default)]
    pub reused_from_id: String,
    #[serde(default)]
    pub fingerprint: String,
    /// Short revision of the tree at diagnosis time; empty when unknown.
    #[serde(default)]
    pub revision: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Distinct tool names observed in the agent stream.
    #[serde(default)]
    pub tools_observed: Vec<String>,
    /// Skills whose tools appeared during the run.
    #[serde(default)]
    pub skills_used: Vec<String>,
    #[serde(default)]
    pub prompt_version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Count graphemes (user-perceived characters) in a string.
#[must_use]
pub fn grapheme_len(s: &str) -> usize {
    s.graphemes(true).count()
}

/// Truncate to at most `max` graphemes; strings at or under the limit are
/// returned verbatim.
#[must_use]
pub fn truncate_graphemes(s: &str, max: usize) -> String {
    let mut indices = s.grapheme_indices(true);
    match indices.nth(max) {
        Some((byte_index, _)) => s[..byte_index].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_priority() {
        assert_eq!(Severity::Critical.priority(), 100);
        assert_eq!(Severity::Warning.priority(), 50);
        assert_eq!(Severity::Info.priority(), 10);
        assert!(Severity::Critical > Severity::Warning);
    }

    #[test]
    fn test_severity_parse_rejects_unknown() {
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(Severity::parse("CRITICAL"), None);
        assert_eq!(Severity::parse("fatal"), None);
    }

    #[test]
    fn test_confidence_label_thresholds() {
        assert_eq!(ConfidenceLabel::from_confidence(0.8), ConfidenceLabel::High);
        assert_eq!(
            ConfidenceLabel::from_confidence(0.79),
            ConfidenceLabel::Medium
        );
        assert_eq!(ConfidenceLabel::from_confidence(0.5), ConfidenceLabel::Medium);
        assert_eq!(ConfidenceLabel::from_confidence(0.49), ConfidenceLabel::Low);
        assert_eq!(ConfidenceLabel::from_confidence(0.0), ConfidenceLabel::Low);
    }

    #[test]
    fn test_truncate_graphemes_boundary() {
        // 200 graphemes stay verbatim; 201 are cut to 200.
        let exact: String = "a".repeat(SUMMARY_MAX_GRAPHEMES);
        assert_eq!(truncate_graphemes(&exact, SUMMARY_MAX_GRAPHEMES), exact);

        let over: String = "a".repeat(SUMMARY_MAX_GRAPHEMES + 1);
        assert_eq!(
            grapheme_len(&truncate_graphemes(&over, SUMMARY_MAX_GRAPHEMES)),
            SUMMARY_MAX_GRAPHEMES
        );
    }

    #[test]
    fn test_truncate_graphemes_multibyte() {
        // Family emoji is one grapheme but many bytes.
        let s = "👨‍👩‍👧‍👦ab";
        assert_eq!(grapheme_len(s), 3);
        assert_eq!(truncate_graphemes(s, 1), "👨‍👩‍👧‍👦");
        assert_eq!(truncate_graphemes(s, 2), "👨‍👩‍👧‍👦a");
    }

    #[test]
    fn test_diagnosis_round_trip() {
        let diagnosis = StructuredDiagnosis {
            schema_version: "1".to_string(),
            summary: "NPE in request handler".to_string(),
            conclusion: Conclusion {
                has_issue: true,
                confidence: 0.9,
                confidence_label: ConfidenceLabel::High,
            },
            root_causes: vec![RootCause {
                rank: 1,
                hypothesis: "unchecked null".to_string(),
                evidence: vec![Evidence {
                    kind: EvidenceType::Code,
                    detail: "handler dereferences request.user".to_string(),
                    file: Some("Foo.java".to_string()),
                    line_start: Some(42),
                    line_end: Some(42),
                }],
                counter_evidence: vec![],
                verification_steps: vec!["replay request without auth".to_string()],
            }],
            code_locations: vec![CodeLocation {
                file: "Foo.java".to_string(),
                line_start: 42,
                line_end: 42,
                reason: "dereference site".to_string(),
            }],
            remediations: vec!["guard the dereference".to_string()],
            next_actions: vec![],
            non_code_factors: vec![],
            insufficient_information: false,
            auto_fixed_evidence_types: vec!["metric".to_string()],
        };

        let json = serde_json::to_string(&diagnosis).unwrap();
        let back: StructuredDiagnosis = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary, diagnosis.summary);
        assert_eq!(back.root_causes.len(), 1);
        assert_eq!(back.code_locations[0].line_start, 42);
        // Internal field does not round-trip.
        assert!(back.auto_fixed_evidence_types.is_empty());
    }

    #[test]
    fn test_quality_score_flag_dedup() {
        let mut score = QualityScore::default();
        score.add_flag(FLAG_NO_EVIDENCE);
        score.add_flag(FLAG_NO_EVIDENCE);
        assert_eq!(score.flags.len(), 1);
        assert!(score.has_flag(FLAG_NO_EVIDENCE));
    }
}
