//! Keyword fallback when no structured output could be recovered.
//!
//! The scan is deliberately blunt: it decides issue / no-issue and a
//! coarse confidence from phrase lists. When nothing matches, the verdict
//! defaults to `has_issue=true`; downstream consumers treat an
//! unparseable diagnosis as actionable rather than silently green.

use crate::entities::{truncate_graphemes, ConfidenceLabel, SUMMARY_MAX_GRAPHEMES};

const NO_ISSUE_PHRASES: &[&str] = &[
    "no issue",
    "no bug",
    "not a code issue",
    "not a code problem",
    "no code issue",
    "works as intended",
    "works as designed",
    "expected behavior",
    "false alarm",
    "not caused by the code",
];

const ISSUE_PHRASES: &[&str] = &[
    "root cause",
    "the bug",
    "a bug",
    "the issue is",
    "issue found",
    "defect",
    "caused by",
    "null pointer",
    "race condition",
    "regression",
    "off-by-one",
];

const HIGH_CONFIDENCE_PHRASES: &[&str] = &["high confidence", "certainly", "clearly", "definitely"];
const LOW_CONFIDENCE_PHRASES: &[&str] = &[
    "low confidence",
    "uncertain",
    "unclear",
    "not sure",
    "insufficient information",
    "cannot determine",
];

/// Verdict recovered by scanning.
#[derive(Debug, Clone)]
pub struct HeuristicVerdict {
    pub has_issue: bool,
    pub confidence: f64,
    pub confidence_label: ConfidenceLabel,
    pub summary: String,
}

/// Scan free text for an issue verdict and confidence hints.
#[must_use]
pub fn detect(text: &str) -> HeuristicVerdict {
    let lowered = text.to_lowercase();

    let contains_any = |phrases: &[&str]| phrases.iter().any(|p| lowered.contains(p));

    // An issue phrase or no match at all both mean has_issue=true; the
    // unparseable default errs toward actionable.
    let has_issue = !contains_any(NO_ISSUE_PHRASES);

    let confidence = if contains_any(LOW_CONFIDENCE_PHRASES) {
        0.3
    } else if contains_any(HIGH_CONFIDENCE_PHRASES) {
        0.85
    } else if contains_any(ISSUE_PHRASES) || !has_issue {
        0.6
    } else {
        0.3
    };

    HeuristicVerdict {
        has_issue,
        confidence,
        confidence_label: ConfidenceLabel::from_confidence(confidence),
        summary: summarize(text),
    }
}

/// First non-empty line, grapheme-bounded.
fn summarize(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("diagnosis output could not be parsed");
    truncate_graphemes(line, SUMMARY_MAX_GRAPHEMES)
}
