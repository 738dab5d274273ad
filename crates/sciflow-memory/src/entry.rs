//! Memory entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One completed interaction; never mutated once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// When the interaction completed
    pub timestamp: DateTime<Utc>,
    /// Original user instruction
    pub instruction: String,
    /// Plan text the code was generated from
    pub plan: String,
    /// Final code
    pub code: String,
    /// Result text shown to the user
    pub result: String,
    /// Arbitrary metadata such as a dataset catalog snapshot
    #[serde(default)]
    pub meta: Value,
}

impl MemoryEntry {
    /// Entry timestamped now with empty metadata
    pub fn new(
        instruction: impl Into<String>,
        plan: impl Into<String>,
        code: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            instruction: instruction.into(),
            plan: plan.into(),
            code: code.into(),
            result: result.into(),
            meta: Value::Object(serde_json::Map::new()),
        }
    }

    /// With metadata
    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// With an explicit timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Number of `terms` found in the instruction or plan
    ///
    /// Terms are expected lowercase; matching is by substring.
    #[must_use]
    pub fn relevance(&self, terms: &[String]) -> usize {
        let haystack = format!("{} {}", self.instruction, self.plan).to_lowercase();
        terms.iter().filter(|t| haystack.contains(t.as_str())).count()
    }

    /// Result truncated to `max` characters
    #[must_use]
    pub fn key_finding(&self, max: usize) -> &str {
        match self.result.char_indices().nth(max) {
            Some((idx, _)) => &self.result[..idx],
            None => &self.result,
        }
    }
}
