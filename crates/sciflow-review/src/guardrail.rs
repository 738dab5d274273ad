//! Static safety scan for generated scripts
//!
//! A denylist of call patterns checked in order against the raw script text.
//! It is a best-effort mitigation, not a security boundary: the sandbox is
//! the boundary.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reason returned for code that passes every rule
pub const SAFE: &str = "Safe";

/// Reason returned for empty or whitespace-only code
pub const EMPTY_CODE: &str = "Code generation appeared to fail (empty response).";

/// Reason returned when code and plan share enough vocabulary
pub const ALIGNED: &str = "Aligned";

/// Reason returned when the code drifts from the plan
pub const MISALIGNED: &str = "Code does not seem aligned with the proposed plan.";

/// Ordered (pattern, reason) rules; the first match wins
const DENYLIST: [(&str, &str); 7] = [
    (r"\bos\.", "OS module access"),
    (r"\bsubprocess\.", "Subprocess execution"),
    (r"\beval\(", "Dangerous eval() call"),
    (r"\bexec\(", "Dangerous exec() call"),
    (r"\bsocket\.", "Network socket access"),
    (r"\brequests\.", "Network request attempt"),
    (r"\bopen\(", "Direct file system access"),
];

/// Compiled denylist; a pattern that fails to compile disables every rule
static RULES: Lazy<Result<Vec<(Regex, &'static str)>, regex::Error>> = Lazy::new(|| {
    DENYLIST
        .into_iter()
        .map(|(pattern, reason)| Regex::new(pattern).map(|re| (re, reason)))
        .collect()
});

static KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w{4,}\b").expect("keyword pattern is valid"));

/// Binary allow/deny verdict with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    /// Whether the script may be trusted
    pub safe: bool,
    /// `Safe`, or why the script was rejected
    pub reason: String,
}

impl GuardrailVerdict {
    fn allow(reason: &str) -> Self {
        Self {
            safe: true,
            reason: reason.to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: reason.into(),
        }
    }
}

/// Stateless guardrail scanner
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardrailAgent;

impl GuardrailAgent {
    /// Create new scanner
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Scan `code` against the rules; fails closed on empty code and when
    /// the denylist cannot be compiled
    #[must_use]
    pub fn scan(&self, code: &str) -> GuardrailVerdict {
        if code.trim().is_empty() {
            return GuardrailVerdict::deny(EMPTY_CODE);
        }
        let rules = match RULES.as_ref() {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(error = %e, "guardrail denylist failed to compile");
                return GuardrailVerdict::deny(format!("Guardrail unavailable: {e}"));
            }
        };
        for (pattern, reason) in rules {
            if pattern.is_match(code) {
                tracing::warn!(rule = *reason, "guardrail violation");
                return GuardrailVerdict::deny(format!("Guardrail Violation: {reason} is prohibited."));
            }
        }
        GuardrailVerdict::allow(SAFE)
    }

    /// Check that `code` shares a minimum vocabulary with `plan`
    ///
    /// Plan keywords are words of four or more characters. Short plans are
    /// always considered aligned.
    #[must_use]
    pub fn audit_alignment(&self, plan: &str, code: &str) -> GuardrailVerdict {
        let keywords = plan_keywords(plan);
        let code = code.to_lowercase();
        let overlap = keywords.iter().filter(|k| code.contains(k.as_str())).count();
        if overlap < 2 && keywords.len() > 5 {
            tracing::debug!(overlap, keywords = keywords.len(), "plan/code drift");
            return GuardrailVerdict::deny(MISALIGNED);
        }
        GuardrailVerdict::allow(ALIGNED)
    }
}

/// Distinct lowercase words of four or more characters
#[must_use]
pub fn plan_keywords(plan: &str) -> BTreeSet<String> {
    let lower = plan.to_lowercase();
    KEYWORD
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}
