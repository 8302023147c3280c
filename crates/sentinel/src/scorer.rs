//! Quality scoring.
//!
//! Six dimensions with a dynamic denominator: dimensions that do not apply
//! are marked with the `-1` sentinel and excluded from `max_possible`, so
//! they neither help nor hurt. Code-location verification touches the
//! working tree and therefore runs while the project lock is held; the
//! arithmetic here is lock-free.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::path::{Component, Path};

use tracing::debug;

use crate::entities::{
    grapheme_len, CodeLocation, ConfidenceLabel, EvidenceType, QualityScore, StructuredDiagnosis,
    FLAG_AUTO_FIXED_EVIDENCE, FLAG_EMPTY_REMEDIATION, FLAG_HALLUCINATED_FILE,
    FLAG_HALLUCINATED_LINE, FLAG_HIGH_CONF_NO_SUPPORT, FLAG_INSUFFICIENT_INFO, FLAG_NO_EVIDENCE,
    SCORE_NA,
};

const MAX_SCHEMA: i32 = 20;
const MAX_EVIDENCE: i32 = 20;
const MAX_CODE_VERIFY: i32 = 20;
const MAX_COHERENCE: i32 = 15;
const MAX_ACTIONABLE: i32 = 15;
const MAX_NON_CODE: i32 = 10;

/// Line-count ceiling for verification reads.
const MAX_COUNTED_LINES: u64 = 500_000;

/// Outcome of checking the referenced file/line ranges on disk.
#[derive(Debug, Clone, Default)]
pub struct LocationVerification {
    pub verified: usize,
    pub total: usize,
    pub flags: Vec<String>,
}

/// Verify each code location against the tree rooted at `source_root`.
///
/// Rejections append `hallucinated_file` / `hallucinated_line` flags and
/// never block the report.
#[must_use]
pub fn verify_locations(source_root: &Path, locations: &[CodeLocation]) -> LocationVerification {
    let mut result = LocationVerification {
        total: locations.len(),
        ..LocationVerification::default()
    };

    for location in locations {
        match verify_one(source_root, location) {
            Ok(()) => result.verified += 1,
            Err(flag) => {
                debug!(file = %location.file, flag, "code location rejected");
                if !result.flags.iter().any(|f| f == flag) {
                    result.flags.push(flag.to_string());
                }
            }
        }
    }
    result
}

fn verify_one(source_root: &Path, location: &CodeLocation) -> Result<(), &'static str> {
    let relative = Path::new(&location.file);
    if relative.is_absolute() {
        return Err(FLAG_HALLUCINATED_FILE);
    }
    // `..` anywhere in the path is an escape attempt regardless of whether
    // it would resolve inside the root.
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(FLAG_HALLUCINATED_FILE);
    }

    let candidate = source_root.join(relative);
    if !candidate.is_file() {
        return Err(FLAG_HALLUCINATED_FILE);
    }

    // Resolve symlinks; the target must stay under the root.
    let canonical_root = source_root
        .canonicalize()
        .map_err(|_| FLAG_HALLUCINATED_FILE)?;
    let canonical = candidate
        .canonicalize()
        .map_err(|_| FLAG_HALLUCINATED_FILE)?;
    if !canonical.starts_with(&canonical_root) {
        return Err(FLAG_HALLUCINATED_FILE);
    }

    if location.line_start > 0 {
        let count = count_lines(&canonical).map_err(|_| FLAG_HALLUCINATED_FILE)?;
        // At the ceiling the count is a lower bound; ranges beyond it are
        // accepted rather than re-read.
        if count < MAX_COUNTED_LINES {
            if location.line_start > count {
                return Err(FLAG_HALLUCINATED_LINE);
            }
            if location.line_end > 0 && location.line_end > count {
                return Err(FLAG_HALLUCINATED_LINE);
            }
        }
    }
    Ok(())
}

fn count_lines(path: &Path) -> std::io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0u64;
    for line in reader.lines() {
        line?;
        count += 1;
        if count >= MAX_COUNTED_LINES {
            break;
        }
    }
    Ok(count)
}

/// Score a validated diagnosis.
///
/// `verification` carries the on-disk check for `code_locations`; it is
/// required exactly when locations are present.
#[must_use]
pub fn score(
    diagnosis: &StructuredDiagnosis,
    verification: Option<&LocationVerification>,
) -> QualityScore {
    let mut result = QualityScore::default();

    // Schema: the parser guarantees most of this; auto-fixed evidence
    // types are the part that can still cost points here.
    let mut schema = 0;
    if !diagnosis.summary.trim().is_empty() {
        schema += 5;
    }
    if (0.0..=1.0).contains(&diagnosis.conclusion.confidence) {
        schema += 5;
    }
    schema += 3; // label normalized during parse
    if !diagnosis.root_causes.is_empty() {
        schema += 5;
    }
    if diagnosis.auto_fixed_evidence_types.is_empty() {
        schema += 2;
    } else {
        result.add_flag(FLAG_AUTO_FIXED_EVIDENCE);
    }
    result.schema = schema;

    // Evidence; an insufficient-information diagnosis is judged on its
    // verification steps instead.
    result.evidence = if diagnosis.insufficient_information {
        result.add_flag(FLAG_INSUFFICIENT_INFO);
        let steps: Vec<&String> = diagnosis
            .root_causes
            .iter()
            .flat_map(|c| &c.verification_steps)
            .collect();
        let mut evidence = 0;
        if !steps.is_empty() {
            evidence += 10;
        }
        if steps.iter().any(|s| grapheme_len(s) > 20) {
            evidence += 10;
        }
        evidence
    } else {
        let count = diagnosis.evidence_count();
        let mut evidence = 0;
        if count > 0 {
            evidence += 10;
        }
        let substantial = diagnosis
            .root_causes
            .iter()
            .flat_map(|c| &c.evidence)
            .any(|e| grapheme_len(&e.detail) > 30 || e.file.is_some());
        if substantial {
            evidence += 10;
        }
        if count == 0 {
            result.add_flag(FLAG_NO_EVIDENCE);
        }
        evidence
    };

    // CodeVerify.
    let has_code_evidence = diagnosis.has_evidence_of(EvidenceType::Code);
    result.code_verify = if diagnosis.code_locations.is_empty() {
        if has_code_evidence {
            // Code-evidence claims with nothing to check are penalized,
            // not excused.
            0
        } else {
            SCORE_NA
        }
    } else {
        let verification = verification.cloned().unwrap_or_default();
        for flag in &verification.flags {
            result.add_flag(flag);
        }
        if verification.total == 0 {
            0
        } else {
            (MAX_CODE_VERIFY * verification.verified as i32) / verification.total as i32
        }
    };

    // Coherence.
    let mut coherence = 0;
    if !diagnosis.conclusion.has_issue || !diagnosis.root_causes.is_empty() {
        coherence += 8;
    }
    let evidence_total = diagnosis.evidence_count();
    let high = diagnosis.conclusion.confidence_label == ConfidenceLabel::High;
    if !high || evidence_total >= 2 {
        coherence += 7;
    }
    if high && evidence_total < 2 {
        result.add_flag(FLAG_HIGH_CONF_NO_SUPPORT);
    }
    result.coherence = coherence;

    // Actionable.
    let mut actionable = 0;
    if diagnosis.remediations.is_empty() {
        result.add_flag(FLAG_EMPTY_REMEDIATION);
    } else {
        actionable += 8;
        if diagnosis.remediations.iter().any(|r| grapheme_len(r) > 20) {
            actionable += 7;
        }
    }
    result.actionable = actionable;

    // NonCodePath applies only without code locations.
    result.non_code_path = if diagnosis.code_locations.is_empty() {
        let mut non_code = 0;
        if !diagnosis.non_code_factors.is_empty() {
            non_code += 5;
            if diagnosis
                .non_code_factors
                .iter()
                .any(|f| grapheme_len(f) > 20)
            {
                non_code += 5;
            }
        }
        non_code
    } else {
        SCORE_NA
    };

    finalize(&mut result);
    result
}

/// Compute `max_possible` and the floor-normalized total from the
/// applicable dimensions.
pub fn finalize(score: &mut QualityScore) {
    let dims = [
        (score.schema, MAX_SCHEMA),
        (score.evidence, MAX_EVIDENCE),
        (score.code_verify, MAX_CODE_VERIFY),
        (score.coherence, MAX_COHERENCE),
        (score.actionable, MAX_ACTIONABLE),
        (score.non_code_path, MAX_NON_CODE),
    ];
    let mut total = 0i64;
    let mut max = 0i64;
    for (value, dim_max) in dims {
        if value != SCORE_NA {
            total += i64::from(value);
            max += i64::from(dim_max);
        }
    }
    score.max_possible = max as u32;
    score.normalized = if max == 0 { 0 } else { (total * 100 / max) as u32 };
}
