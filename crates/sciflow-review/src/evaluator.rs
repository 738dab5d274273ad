//! Heuristic result scoring
//!
//! A coarse gate that flags degenerate results for review. It never blocks a
//! response.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Score at or above which a result passes
pub const PASS_THRESHOLD: u8 = 70;

const ERROR_PENALTY: u8 = 50;
const MISSING_EXPECTED_PENALTY: u8 = 30;
const TERMINOLOGY_PENALTY: u8 = 10;

/// Terms expected somewhere in a statistical result
const SCIENTIFIC_TERMS: [&str; 5] = ["mean", "distribution", "variance", "p-value", "significant"];

/// Calls the code-quality audit warns about
const PROHIBITED_CALLS: [&str; 4] = ["exec(", "eval(", "os.system", "subprocess"];

/// Pass/fail status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvalStatus {
    /// Score reached the threshold
    Pass,
    /// Score below the threshold
    Fail,
}

impl Display for EvalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        })
    }
}

/// Result of scoring one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// 0-100
    pub score: u8,
    /// One entry per applied penalty
    pub deductions: Vec<String>,
    /// Pass/fail against [`PASS_THRESHOLD`]
    pub status: EvalStatus,
}

/// Code quality rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityRating {
    /// No issues or warnings
    High,
    /// At least one issue or warning
    Low,
}

/// Result of the static code-quality audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeQuality {
    /// Blocking findings
    pub issues: Vec<String>,
    /// Advisory findings
    pub warnings: Vec<String>,
    /// Overall rating
    pub rating: QualityRating,
}

impl CodeQuality {
    /// Whether no prohibited calls were found
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Stateless evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    /// Create new evaluator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Score a result text, optionally requiring an expected snippet
    #[must_use]
    pub fn score_execution(&self, result: &str, expected: Option<&str>) -> Evaluation {
        let mut score = 100u8;
        let mut deductions = Vec::new();

        if result.contains("Error") {
            score = score.saturating_sub(ERROR_PENALTY);
            deductions.push("Execution error detected.".to_string());
        }

        if let Some(expected) = expected {
            if !result.contains(expected) {
                score = score.saturating_sub(MISSING_EXPECTED_PENALTY);
                deductions.push(format!("Expected output '{expected}' not found."));
            }
        }

        let lower = result.to_lowercase();
        if !SCIENTIFIC_TERMS.iter().any(|t| lower.contains(t)) {
            score = score.saturating_sub(TERMINOLOGY_PENALTY);
            deductions.push("Low scientific terminology in response.".to_string());
        }

        let status = if score >= PASS_THRESHOLD {
            EvalStatus::Pass
        } else {
            EvalStatus::Fail
        };
        tracing::debug!(score, %status, "execution scored");
        Evaluation {
            score,
            deductions,
            status,
        }
    }

    /// Static audit for prohibited calls and missing imports
    #[must_use]
    pub fn evaluate_code_quality(&self, code: &str) -> CodeQuality {
        let issues: Vec<String> = PROHIBITED_CALLS
            .iter()
            .filter(|p| code.contains(*p))
            .map(|p| format!("Security Warning: Prohibited call '{p}' detected."))
            .collect();

        let mut warnings = Vec::new();
        if !code.contains("import") {
            warnings.push("No imports detected (might be incomplete).".to_string());
        }

        let rating = if issues.is_empty() && warnings.is_empty() {
            QualityRating::High
        } else {
            QualityRating::Low
        };
        CodeQuality {
            issues,
            warnings,
            rating,
        }
    }
}
