//! Review council
//!
//! Independent specialists annotate the same (plan, code, result) triple.
//! The council never filters or blocks; reports keep registration order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest code block the architect accepts without comment
pub const MAX_CODE_LINES: usize = 50;

/// What every specialist reviews
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Approved plan text (may be empty)
    pub plan: &'a str,
    /// Final script
    pub code: &'a str,
    /// Execution result text
    pub result: &'a str,
}

impl<'a> Submission<'a> {
    /// Bundle a review triple
    #[inline]
    #[must_use]
    pub fn new(plan: &'a str, code: &'a str, result: &'a str) -> Self {
        Self { plan, code, result }
    }
}

/// One specialist's report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    /// Reviewer name
    pub reviewer: String,
    /// Score 0-100, when the reviewer scores at all
    pub score: Option<u8>,
    /// Textual findings, possibly empty
    pub findings: Vec<String>,
}

impl ReviewReport {
    /// Report with no score
    #[must_use]
    pub fn unscored(reviewer: &str, findings: Vec<String>) -> Self {
        Self {
            reviewer: reviewer.to_string(),
            score: None,
            findings,
        }
    }
}

/// A pluggable reviewer policy
///
/// Specialists must not depend on each other's output.
pub trait Specialist: Send + Sync + fmt::Debug {
    /// Reviewer name used in reports
    fn name(&self) -> &str;

    /// Inspect the submission
    fn review(&self, submission: &Submission<'_>) -> ReviewReport;
}

/// Plot aesthetics: titles and axis labels
#[derive(Debug, Clone, Copy, Default)]
pub struct Visualizer;

impl Specialist for Visualizer {
    fn name(&self) -> &str {
        "Visualizer"
    }

    fn review(&self, submission: &Submission<'_>) -> ReviewReport {
        let code = submission.code;
        if !(code.contains("plt.") || code.contains("sns.")) {
            return ReviewReport::unscored(self.name(), Vec::new());
        }

        let mut score = 100u8;
        let mut findings = Vec::new();
        if !code.contains("plt.title") {
            score -= 20;
            findings.push("Missing plot title.".to_string());
        }
        if !code.contains("plt.xlabel") || !code.contains("plt.ylabel") {
            score -= 20;
            findings.push("Missing axis labels.".to_string());
        }
        if !code.contains("sns.set_theme") {
            findings.push("Tip: Use sns.set_theme(style='whitegrid') for better aesthetics.".to_string());
        }
        ReviewReport {
            reviewer: self.name().to_string(),
            score: Some(score),
            findings,
        }
    }
}

/// Statistical rigor: claimed tests must report p-values
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistician;

impl Statistician {
    fn is_relevant(plan: &str) -> bool {
        ["test", "stats", "model"].iter().any(|w| plan.contains(w))
    }
}

impl Specialist for Statistician {
    fn name(&self) -> &str {
        "Statistician"
    }

    fn review(&self, submission: &Submission<'_>) -> ReviewReport {
        let plan = submission.plan.to_lowercase();
        let mut findings = Vec::new();
        if Self::is_relevant(&plan) {
            let result = submission.result.to_lowercase();
            if !result.contains("p-value") && !result.contains("p_value") {
                findings.push(
                    "Scientific Warning: Analysis mentions testing but no p-value reported.".to_string(),
                );
            }
            if plan.contains("normality") && !submission.code.to_lowercase().contains("shapiro") {
                findings.push(
                    "Scientific Warning: Normality check promised in plan but missing from code."
                        .to_string(),
                );
            }
        }
        ReviewReport::unscored(self.name(), findings)
    }
}

/// Code shape: block length and row-wise iteration
#[derive(Debug, Clone, Copy, Default)]
pub struct Architect;

impl Specialist for Architect {
    fn name(&self) -> &str {
        "Architect"
    }

    fn review(&self, submission: &Submission<'_>) -> ReviewReport {
        let code = submission.code;
        let mut findings = Vec::new();
        if code.split('\n').count() > MAX_CODE_LINES {
            findings.push("Performance Tip: Code block is getting long. Consider modularizing.".to_string());
        }
        if code.contains("for index, row in") || code.contains(".iterrows()") {
            findings.push(
                "Performance Warning: Iterative row processing detected. Use vectorized operations for speed."
                    .to_string(),
            );
        }
        ReviewReport::unscored(self.name(), findings)
    }
}

/// Aggregated council output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouncilVerdict {
    /// One report per specialist, in registration order
    pub reviews: Vec<ReviewReport>,
}

impl CouncilVerdict {
    /// Every finding tagged with its reviewer
    pub fn findings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.reviews.iter().flat_map(|r| {
            r.findings
                .iter()
                .map(move |f| (r.reviewer.as_str(), f.as_str()))
        })
    }

    /// Findings formatted for appending to a result, `None` if there are none
    #[must_use]
    pub fn summary(&self) -> Option<String> {
        let lines: Vec<String> = self
            .findings()
            .map(|(reviewer, finding)| format!("- [{reviewer}] {finding}"))
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(format!("--- Council Review ---\n{}", lines.join("\n")))
        }
    }
}

/// Registry of specialists
#[derive(Debug)]
pub struct TheCouncil {
    specialists: Vec<Box<dyn Specialist>>,
}

impl Default for TheCouncil {
    fn default() -> Self {
        Self::new()
    }
}

impl TheCouncil {
    /// Council with the built-in visualizer, statistician and architect
    #[must_use]
    pub fn new() -> Self {
        Self::empty()
            .with_specialist(Visualizer)
            .with_specialist(Statistician)
            .with_specialist(Architect)
    }

    /// Council with no specialists
    #[must_use]
    pub fn empty() -> Self {
        Self {
            specialists: Vec::new(),
        }
    }

    /// Register a specialist after the existing ones
    #[must_use]
    pub fn with_specialist(mut self, specialist: impl Specialist + 'static) -> Self {
        self.register(specialist);
        self
    }

    /// Register a specialist after the existing ones
    pub fn register(&mut self, specialist: impl Specialist + 'static) {
        self.specialists.push(Box::new(specialist));
    }

    /// Number of registered specialists
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.specialists.len()
    }

    /// Whether no specialist is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specialists.is_empty()
    }

    /// Run every specialist over the same triple
    #[tracing::instrument(skip_all, fields(specialists = self.specialists.len()))]
    pub fn adjudicate(&self, plan: &str, code: &str, result: &str) -> CouncilVerdict {
        let submission = Submission::new(plan, code, result);
        let reviews: Vec<ReviewReport> = self
            .specialists
            .iter()
            .map(|s| s.review(&submission))
            .collect();
        tracing::debug!(
            findings = reviews.iter().map(|r| r.findings.len()).sum::<usize>(),
            "council adjudicated"
        );
        CouncilVerdict { reviews }
    }
}
