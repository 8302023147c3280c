//! Structured-output parsing and repair.
//!
//! Four layers, each tried only when the previous failed:
//!
//! 1. extract a JSON object from the agent's final text
//! 2. parse + validate (tolerant of label/evidence-type drift)
//! 3. deterministic local repair of common truncation damage
//! 4. a short, resource-limited agent invocation that fixes syntax only
//!
//! When everything fails the engine falls back to keyword heuristics and
//! flags the report `schema_invalid`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use amp_client::{AgentExecutor, ExecuteOptions};

use crate::entities::{
    truncate_graphemes, CodeLocation, Conclusion, ConfidenceLabel, Evidence, EvidenceType,
    RootCause, StructuredDiagnosis, SUMMARY_MAX_GRAPHEMES,
};
use crate::error::SentinelError;

/// Deadline for the layer-4 fixer subprocess.
const FIXER_TIMEOUT: Duration = Duration::from_secs(90);

/// Prompt wrapped around malformed output for the layer-4 fixer.
const FIXER_INSTRUCTIONS: &str = "The following text is meant to be a single JSON object but has \
syntax errors. Output ONLY the corrected JSON object. Fix syntax only: do not add, remove, or \
rename any field, and do not change any value.";

// ---------------------------------------------------------------------------
// Layer 1: extraction
// ---------------------------------------------------------------------------

/// Extract the JSON object from free-form agent text.
///
/// Preference order: a fenced block tagged `json`, then any fenced block
/// whose content starts with `{`, then a brace-balanced substring starting
/// at the first `{`.
#[must_use]
pub fn extract_json(text: &str) -> Option<String> {
    if let Some(block) = fenced_block(text, true) {
        return Some(block);
    }
    if let Some(block) = fenced_block(text, false) {
        return Some(block);
    }
    balanced_object(text)
}

/// Find a fenced code block. With `tagged`, only ```json fences match;
/// otherwise any fence whose body starts with `{`.
fn fenced_block(text: &str, tagged: bool) -> Option<String> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let newline = after.find('\n')?;
        let tag = after[..newline].trim();
        let body_start = newline + 1;
        let Some(end) = after[body_start..].find("```") else {
            return None;
        };
        let body = after[body_start..body_start + end].trim();

        let matches = if tagged {
            tag.eq_ignore_ascii_case("json")
        } else {
            body.starts_with('{')
        };
        if matches && !body.is_empty() {
            return Some(body.to_string());
        }
        rest = &after[body_start + end + 3..];
    }
    None
}

/// Take a brace-balanced substring starting at the first `{`, tracking
/// string boundaries character-accurately.
fn balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let candidate = &text[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, c) in candidate.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(candidate[..=index].to_string());
                }
            }
            _ => {}
        }
    }
    // Unbalanced; hand the whole tail to the repair layers.
    Some(candidate.to_string())
}

// ---------------------------------------------------------------------------
// Layer 2: parse + validate
// ---------------------------------------------------------------------------

// Wire-tolerant mirror of the diagnosis schema. Label and evidence types
// arrive as free strings and are normalized during conversion.
#[derive(Deserialize)]
struct RawDiagnosis {
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(default)]
    summary: String,
    conclusion: RawConclusion,
    #[serde(default)]
    root_causes: Vec<RawRootCause>,
    #[serde(default)]
    code_locations: Vec<CodeLocation>,
    #[serde(default)]
    remediations: Vec<String>,
    #[serde(default)]
    next_actions: Vec<String>,
    #[serde(default)]
    non_code_factors: Vec<String>,
    #[serde(default)]
    insufficient_information: bool,
}

#[derive(Deserialize)]
struct RawConclusion {
    has_issue: bool,
    confidence: f64,
    #[serde(default)]
    confidence_label: Option<String>,
}

#[derive(Deserialize)]
struct RawRootCause {
    #[serde(default)]
    rank: u32,
    #[serde(default)]
    hypothesis: String,
    #[serde(default)]
    evidence: Vec<RawEvidence>,
    #[serde(default)]
    counter_evidence: Vec<String>,
    #[serde(default)]
    verification_steps: Vec<String>,
}

#[derive(Deserialize)]
struct RawEvidence {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line_start: Option<u64>,
    #[serde(default)]
    line_end: Option<u64>,
}

/// Parse extracted JSON and enforce the schema's semantic rules.
pub fn parse_and_validate(json: &str) -> Result<StructuredDiagnosis, SentinelError> {
    let raw: RawDiagnosis =
        serde_json::from_str(json).map_err(|e| SentinelError::ParseFailed(e.to_string()))?;

    if raw.summary.trim().is_empty() {
        return Err(SentinelError::ParseFailed("empty summary".to_string()));
    }
    if !(0.0..=1.0).contains(&raw.conclusion.confidence) {
        return Err(SentinelError::ParseFailed(format!(
            "confidence {} outside [0, 1]",
            raw.conclusion.confidence
        )));
    }
    if raw.root_causes.is_empty() {
        return Err(SentinelError::ParseFailed("no root causes".to_string()));
    }

    let computed = ConfidenceLabel::from_confidence(raw.conclusion.confidence);
    let label = match raw.conclusion.confidence_label.as_deref() {
        Some("high") => ConfidenceLabel::High,
        Some("medium") => ConfidenceLabel::Medium,
        Some("low") => ConfidenceLabel::Low,
        _ => computed,
    };
    // The numeric value is authoritative: a label inconsistent with it is
    // corrected, never the other way around.
    let label = if label == computed { label } else { computed };

    let mut auto_fixed = Vec::new();
    let root_causes = raw
        .root_causes
        .into_iter()
        .map(|cause| RootCause {
            rank: cause.rank,
            hypothesis: cause.hypothesis,
            evidence: cause
                .evidence
                .into_iter()
                .map(|e| {
                    let kind = match e.kind.as_deref() {
                        Some("code") => EvidenceType::Code,
                        Some("log") => EvidenceType::Log,
                        Some("stack") => EvidenceType::Stack,
                        Some("config") => EvidenceType::Config,
                        other => {
                            auto_fixed.push(other.unwrap_or("missing").to_string());
                            EvidenceType::Log
                        }
                    };
                    Evidence {
                        kind,
                        detail: e.detail,
                        file: e.file,
                        line_start: e.line_start,
                        line_end: e.line_end,
                    }
                })
                .collect(),
            counter_evidence: cause.counter_evidence,
            verification_steps: cause.verification_steps,
        })
        .collect();

    Ok(StructuredDiagnosis {
        schema_version: raw.schema_version.unwrap_or_else(|| "1".to_string()),
        summary: truncate_graphemes(raw.summary.trim(), SUMMARY_MAX_GRAPHEMES),
        conclusion: Conclusion {
            has_issue: raw.conclusion.has_issue,
            confidence: raw.conclusion.confidence,
            confidence_label: label,
        },
        root_causes,
        code_locations: raw.code_locations,
        remediations: raw.remediations,
        next_actions: raw.next_actions,
        non_code_factors: raw.non_code_factors,
        insufficient_information: raw.insufficient_information,
        auto_fixed_evidence_types: auto_fixed,
    })
}

// ---------------------------------------------------------------------------
// Layer 3: deterministic repair
// ---------------------------------------------------------------------------

/// Repair common truncation damage: trailing commas before `}`/`]`, a
/// dangling unterminated string, unbalanced `{`/`[`. Idempotent on
/// well-formed input.
#[must_use]
pub fn deterministic_repair(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in json.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    if in_string {
        out.push('"');
    }
    drop_trailing_comma(&mut out);
    while let Some(closer) = stack.pop() {
        drop_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

/// Remove a `,` that is the last non-whitespace char of `out`.
fn drop_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end();
    if trimmed.ends_with(',') {
        let cut = trimmed.len() - 1;
        let tail: String = out[trimmed.len()..].to_string();
        out.truncate(cut);
        out.push_str(&tail);
    }
}

// ---------------------------------------------------------------------------
// Layer 4: agent-based repair + the combined entry point
// ---------------------------------------------------------------------------

/// Parse the agent's final text, escalating through the repair layers.
///
/// `fixer` is the optional layer-4 executor; it runs with an independent
/// cancellation token because the diagnosis context may already be near
/// expiry after the main run.
pub async fn parse_with_repair(
    text: &str,
    fixer: Option<&dyn AgentExecutor>,
) -> Result<StructuredDiagnosis, SentinelError> {
    let extracted = extract_json(text)
        .ok_or_else(|| SentinelError::ParseFailed("no JSON object in output".to_string()))?;

    let first_error = match parse_and_validate(&extracted) {
        Ok(diagnosis) => return Ok(diagnosis),
        Err(e) => e,
    };

    debug!(error = %first_error, "structured parse failed, trying deterministic repair");
    let repaired = deterministic_repair(&extracted);
    if repaired != extracted {
        if let Ok(diagnosis) = parse_and_validate(&repaired) {
            return Ok(diagnosis);
        }
    }

    let Some(fixer) = fixer else {
        return Err(first_error);
    };

    debug!("deterministic repair failed, invoking agent fixer");
    match llm_repair(fixer, &extracted).await {
        Ok(fixed) => parse_and_validate(&fixed),
        Err(e) => {
            warn!(error = %e, "agent fixer failed");
            Err(first_error)
        }
    }
}

async fn llm_repair(fixer: &dyn AgentExecutor, malformed: &str) -> Result<String, SentinelError> {
    let prompt = format!("{FIXER_INSTRUCTIONS}\n\n{malformed}");
    let options = ExecuteOptions {
        workdir: std::env::temp_dir(),
        mode: Some("rush".to_string()),
        permissions: amp_client::default_rules(),
        servers: std::collections::HashMap::new(),
        labels: vec!["json-fixer".to_string()],
        env: BTreeMap::new(),
    };

    let mut sink = |_: &str, _: &amp_client::StreamMessage| Ok(());
    let result = tokio::time::timeout(
        FIXER_TIMEOUT,
        fixer.execute(&prompt, options, CancellationToken::new(), &mut sink),
    )
    .await
    .map_err(|_| SentinelError::Timeout)??;

    if result.is_error {
        return Err(SentinelError::ParseFailed(format!(
            "fixer reported error: {}",
            result.error
        )));
    }
    extract_json(&result.text)
        .ok_or_else(|| SentinelError::ParseFailed("fixer produced no JSON".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "summary": "NPE in handler",
        "conclusion": {"has_issue": true, "confidence": 0.9, "confidence_label": "high"},
        "root_causes": [{"rank": 1, "hypothesis": "null deref", "evidence": [
            {"type": "code", "detail": "deref at Foo.java:42", "file": "Foo.java",
             "line_start": 42, "line_end": 42}
        ]}],
        "code_locations": [{"file": "Foo.java", "line_start": 42, "line_end": 42,
                            "reason": "deref site"}],
        "remediations": ["add a null guard"]
    }"#;

    #[test]
    fn test_extract_prefers_tagged_fence() {
        let text = format!("preamble\n```\n{{\"a\":1}}\n```\nand\n```json\n{VALID}\n```\ntail");
        let extracted = extract_json(&text).unwrap();
        assert!(extracted.contains("NPE in handler"));
    }

    #[test]
    fn test_extract_untagged_fence() {
        let text = format!("thoughts\n```\n{VALID}\n```");
        assert!(extract_json(&text).unwrap().contains("NPE in handler"));
    }

    #[test]
    fn test_extract_balanced_substring() {
        let text = format!("The diagnosis is {VALID} and that is all.");
        let extracted = extract_json(&text).unwrap();
        assert!(extracted.starts_with('{'));
        assert!(extracted.ends_with('}'));
        assert!(parse_and_validate(&extracted).is_ok());
    }

    #[test]
    fn test_extract_handles_braces_in_strings() {
        let text = r#"x {"summary": "brace } in string", "conclusion": {"has_issue": false, "confidence": 0.2}, "root_causes": [{"rank":1,"hypothesis":"h"}]} y"#;
        let extracted = extract_json(text).unwrap();
        assert!(extracted.ends_with('}'));
        assert!(parse_and_validate(&extracted).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_summary_and_bad_confidence() {
        let empty = r#"{"summary": " ", "conclusion": {"has_issue": true, "confidence": 0.5}, "root_causes": [{"rank":1,"hypothesis":"h"}]}"#;
        assert!(parse_and_validate(empty).is_err());

        let out_of_range = r#"{"summary": "s", "conclusion": {"has_issue": true, "confidence": 1.5}, "root_causes": [{"rank":1,"hypothesis":"h"}]}"#;
        assert!(parse_and_validate(out_of_range).is_err());

        let no_causes = r#"{"summary": "s", "conclusion": {"has_issue": true, "confidence": 0.5}, "root_causes": []}"#;
        assert!(parse_and_validate(no_causes).is_err());
    }

    #[test]
    fn test_validate_corrects_label_from_numeric() {
        let mismatched = r#"{"summary": "s", "conclusion": {"has_issue": true, "confidence": 0.3, "confidence_label": "high"}, "root_causes": [{"rank":1,"hypothesis":"h"}]}"#;
        let diagnosis = parse_and_validate(mismatched).unwrap();
        assert_eq!(diagnosis.conclusion.confidence_label, ConfidenceLabel::Low);

        let missing = r#"{"summary": "s", "conclusion": {"has_issue": true, "confidence": 0.6}, "root_causes": [{"rank":1,"hypothesis":"h"}]}"#;
        let diagnosis = parse_and_validate(missing).unwrap();
        assert_eq!(diagnosis.conclusion.confidence_label, ConfidenceLabel::Medium);
    }

    #[test]
    fn test_validate_coerces_unknown_evidence_type() {
        let json = r#"{"summary": "s", "conclusion": {"has_issue": true, "confidence": 0.6},
            "root_causes": [{"rank":1,"hypothesis":"h","evidence":[{"type":"metric","detail":"d"}]}]}"#;
        let diagnosis = parse_and_validate(json).unwrap();
        assert_eq!(diagnosis.root_causes[0].evidence[0].kind, EvidenceType::Log);
        assert_eq!(diagnosis.auto_fixed_evidence_types, vec!["metric".to_string()]);
    }

    #[test]
    fn test_validate_truncates_long_summary() {
        let long = "x".repeat(SUMMARY_MAX_GRAPHEMES + 50);
        let json = format!(
            r#"{{"summary": "{long}", "conclusion": {{"has_issue": true, "confidence": 0.6}}, "root_causes": [{{"rank":1,"hypothesis":"h"}}]}}"#
        );
        let diagnosis = parse_and_validate(&json).unwrap();
        assert_eq!(
            crate::entities::grapheme_len(&diagnosis.summary),
            SUMMARY_MAX_GRAPHEMES
        );
    }

    #[test]
    fn test_repair_trailing_commas() {
        let broken = r#"{"summary":"x","conclusion":{"has_issue":true,"confidence":0.9,"confidence_label":"high"},"root_causes":[{"rank":1,"hypothesis":"h",},],}"#;
        let repaired = deterministic_repair(broken);
        assert!(parse_and_validate(&repaired).is_ok());
    }

    #[test]
    fn test_repair_dangling_string_and_brackets() {
        let broken = r#"{"summary":"trunc"#;
        let repaired = deterministic_repair(broken);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["summary"], "trunc");

        let broken = r#"{"a": [1, 2"#;
        let repaired = deterministic_repair(broken);
        assert_eq!(repaired, r#"{"a": [1, 2]}"#);
    }

    #[test]
    fn test_repair_idempotent_on_well_formed() {
        assert_eq!(deterministic_repair(VALID), VALID);
        let with_comma_in_string = r#"{"a": "x, ", "b": [1, 2]}"#;
        assert_eq!(
            deterministic_repair(with_comma_in_string),
            with_comma_in_string
        );
    }

    #[tokio::test]
    async fn test_parse_with_repair_recovers_trailing_commas() {
        let text = format!(
            "```json\n{}\n```",
            r#"{"summary":"x","conclusion":{"has_issue":true,"confidence":0.9,"confidence_label":"high"},"root_causes":[{"rank":1,"hypothesis":"h",},],}"#
        );
        let diagnosis = parse_with_repair(&text, None).await.unwrap();
        assert!(diagnosis.conclusion.has_issue);
    }

    #[tokio::test]
    async fn test_parse_with_repair_fails_without_fixer() {
        let err = parse_with_repair("no json here at all", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "parse_failed");
    }
}
