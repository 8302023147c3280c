//! Fingerprinting and reuse decisions.
//!
//! A fingerprint reduces the probability that two reports of the same
//! underlying fault both pay the full diagnosis cost. It is a pure
//! function of `(project_key, canonicalized payload subset, environment)`.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest as _, Sha256};

use crate::entities::{Report, Severity, FLAG_HALLUCINATED_FILE, FLAG_HALLUCINATED_LINE, FLAG_INSUFFICIENT_INFO, FLAG_REUSED_STALE_COMMIT};

/// Payload locations probed for an environment marker, in order.
const ENV_PATHS: &[&str] = &[
    "environment",
    "env",
    "deploy_env",
    "stage",
    "labels.env",
    "tags.env",
    "tags.environment",
];

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:[Zz]|[+-]\d{2}:?\d{2})?",
    )
    .expect("valid regex")
});

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("valid regex")
});

static ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0[xX][0-9a-fA-F]{4,16}").expect("valid regex"));

static LONG_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{8,}").expect("valid regex"));

/// Canonicalize one string leaf: volatile substrings become placeholders,
/// then the result is lowercased and trimmed.
#[must_use]
pub fn canonicalize(s: &str) -> String {
    let s = TIMESTAMP_RE.replace_all(s, "<TS>");
    let s = UUID_RE.replace_all(&s, "<UUID>");
    let s = ADDR_RE.replace_all(&s, "<ADDR>");
    let s = LONG_NUMBER_RE.replace_all(&s, "<N>");
    s.trim().to_lowercase()
}

/// Traverse a dotted path through objects and numeric array indices.
fn lookup<'a>(payload: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Render a scalar for digesting; string leaves are canonicalized,
/// non-strings pass through as JSON text.
fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(canonicalize(s)),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compute the fingerprint for a payload.
///
/// `fields` is the ordered path list; with `is_override=false` (system
/// defaults) at most the first two matching scalars contribute, a
/// project-provided set contributes every match.
#[must_use]
pub fn compute(
    project_key: &str,
    payload: &serde_json::Value,
    fields: &[String],
    is_override: bool,
) -> String {
    let limit = if is_override { usize::MAX } else { 2 };

    let mut parts = Vec::new();
    for path in fields {
        if parts.len() >= limit {
            break;
        }
        if let Some(text) = lookup(payload, path).and_then(scalar_text) {
            parts.push(format!("{path}={text}"));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(project_key.as_bytes());
    hasher.update(b"\n");
    hasher.update(parts.join("|").as_bytes());
    let digest = hasher.finalize();
    let mut fingerprint = hex::encode(&digest[..8]);

    if let Some(env) = environment(payload) {
        fingerprint.push(':');
        fingerprint.push_str(&env);
    }
    fingerprint
}

/// Environment marker from the payload, if any.
fn environment(payload: &serde_json::Value) -> Option<String> {
    for path in ENV_PATHS {
        if let Some(value) = lookup(payload, path) {
            match value {
                serde_json::Value::String(s) if !s.trim().is_empty() => {
                    return Some(s.trim().to_lowercase());
                }
                serde_json::Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// Evaluate whether a cached report can stand in for a fresh diagnosis.
///
/// Returns `(ok, extra_flags)`; accepted candidates may carry
/// [`FLAG_REUSED_STALE_COMMIT`] when the tree has moved since the original
/// ran. A revision unknown on either side is treated as matching.
#[must_use]
pub fn can_reuse(
    candidate: &Report,
    current_revision: &str,
    severity: Severity,
    min_score: u32,
) -> (bool, Vec<String>) {
    if candidate.tainted {
        return (false, Vec::new());
    }
    let insufficient = candidate.quality.has_flag(FLAG_INSUFFICIENT_INFO)
        || candidate
            .diagnosis
            .as_ref()
            .is_some_and(|d| d.insufficient_information);
    if insufficient {
        return (false, Vec::new());
    }
    if candidate.quality.has_flag(FLAG_HALLUCINATED_FILE)
        || candidate.quality.has_flag(FLAG_HALLUCINATED_LINE)
    {
        return (false, Vec::new());
    }
    if candidate.quality.normalized < min_score {
        return (false, Vec::new());
    }

    let known = !candidate.revision.is_empty() && !current_revision.is_empty();
    if known && candidate.revision != current_revision {
        if severity == Severity::Critical {
            return (false, Vec::new());
        }
        return (true, vec![FLAG_REUSED_STALE_COMMIT.to_string()]);
    }

    (true, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ConfidenceLabel, QualityScore};
    use chrono::Utc;

    fn default_fields() -> Vec<String> {
        ["error_msg", "error", "message", "msg"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn report(normalized: u32) -> Report {
        Report {
            id: "r-1".to_string(),
            event_id: "e-1".to_string(),
            project_key: "svc-a".to_string(),
            title: String::new(),
            severity: Severity::Warning,
            has_issue: true,
            confidence: 0.9,
            confidence_label: ConfidenceLabel::High,
            summary: String::new(),
            diagnosis: None,
            quality: QualityScore {
                normalized,
                ..QualityScore::default()
            },
            tainted: false,
            reused_from_id: String::new(),
            fingerprint: "abc".to_string(),
            revision: "deadbee".to_string(),
            duration_ms: 100,
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
    fn test_canonicalize_replaces_volatile_tokens() {
        assert_eq!(
            canonicalize("Error at 2026-08-01T12:30:45Z in worker"),
            "error at <ts> in worker"
        );
        assert_eq!(
            canonicalize("session 550e8400-e29b-41d4-a716-446655440000 died"),
            "session <uuid> died"
        );
        assert_eq!(canonicalize("ptr 0xDEADBEEF freed"), "ptr <addr> freed");
        assert_eq!(canonicalize("request 123456789 failed"), "request <n> failed");
        assert_eq!(canonicalize("  Mixed CASE  "), "mixed case");
    }

    #[test]
    fn test_fingerprint_stable_under_volatile_changes() {
        let a = serde_json::json!({"error_msg": "NPE at Foo.java, request 111111111"});
        let b = serde_json::json!({"error_msg": "NPE at Foo.java, request 999999999"});
        let fields = default_fields();
        assert_eq!(
            compute("svc-a", &a, &fields, false),
            compute("svc-a", &b, &fields, false)
        );
    }

    #[test]
    fn test_fingerprint_differs_per_project() {
        let payload = serde_json::json!({"error_msg": "boom"});
        let fields = default_fields();
        assert_ne!(
            compute("svc-a", &payload, &fields, false),
            compute("svc-b", &payload, &fields, false)
        );
    }

    #[test]
    fn test_default_fields_take_first_two_matches() {
        let payload = serde_json::json!({
            "error_msg": "a", "error": "b", "message": "c"
        });
        let fields = default_fields();
        let truncated = serde_json::json!({"error_msg": "a", "error": "b"});
        assert_eq!(
            compute("p", &payload, &fields, false),
            compute("p", &truncated, &fields, false)
        );
    }

    #[test]
    fn test_override_fields_take_all_matches() {
        let a = serde_json::json!({"x": "1", "y": "2", "z": "3"});
        let b = serde_json::json!({"x": "1", "y": "2", "z": "different"});
        let fields: Vec<String> = ["x", "y", "z"].iter().map(ToString::to_string).collect();
        assert_ne!(compute("p", &a, &fields, true), compute("p", &b, &fields, true));
    }

    #[test]
    fn test_environment_suffix() {
        let plain = serde_json::json!({"error_msg": "boom"});
        let fields = default_fields();
        let with_env = serde_json::json!({"error_msg": "boom", "labels": {"env": "Prod"}});
        let fp = compute("p", &with_env, &fields, false);
        assert!(fp.ends_with(":prod"), "got {fp}");
        assert!(!compute("p", &plain, &fields, false).contains(':'));
    }

    #[test]
    fn test_array_index_paths() {
        let payload = serde_json::json!({"alerts": [{"message": "disk full"}]});
        let fields = vec!["alerts.0.message".to_string()];
        let fp = compute("p", &payload, &fields, true);
        let other = compute("p", &serde_json::json!({"alerts": []}), &fields, true);
        assert_ne!(fp, other);
    }

    #[test]
    fn test_can_reuse_rejects_tainted() {
        let mut candidate = report(90);
        candidate.tainted = true;
        assert!(!can_reuse(&candidate, "deadbee", Severity::Warning, 60).0);
    }

    #[test]
    fn test_can_reuse_rejects_low_score_and_hallucination() {
        assert!(!can_reuse(&report(59), "deadbee", Severity::Warning, 60).0);

        let mut candidate = report(90);
        candidate.quality.add_flag(FLAG_HALLUCINATED_FILE);
        assert!(!can_reuse(&candidate, "deadbee", Severity::Warning, 60).0);
    }

    #[test]
    fn test_can_reuse_stale_revision_policy() {
        let candidate = report(90);

        // Critical + moved tree: reject.
        let (ok, _) = can_reuse(&candidate, "0000000", Severity::Critical, 60);
        assert!(!ok);

        // Warning + moved tree: accept with the stale flag.
        let (ok, flags) = can_reuse(&candidate, "0000000", Severity::Warning, 60);
        assert!(ok);
        assert_eq!(flags, vec![FLAG_REUSED_STALE_COMMIT.to_string()]);

        // Same revision: accept clean.
        let (ok, flags) = can_reuse(&candidate, "deadbee", Severity::Critical, 60);
        assert!(ok);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_can_reuse_unknown_revision_matches() {
        let mut candidate = report(90);
        candidate.revision = String::new();
        let (ok, flags) = can_reuse(&candidate, "deadbee", Severity::Critical, 60);
        assert!(ok);
        assert!(flags.is_empty());
    }
}
