//! Core types for the scientific flow

use crate::error::FlowError;
use base64::Engine as _;
use sciflow_review::{Evaluation, GuardrailVerdict, ReviewReport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use ulid::Ulid;

/// Unique request identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Ulid);

impl RequestId {
    /// Generate new request ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated tabular dataset
///
/// Cells are JSON values; every row has exactly one cell per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    /// Build a dataset, checking it is rectangular with unique column names
    ///
    /// # Errors
    /// Returns `FlowError::Dataset` on ragged rows or duplicate columns.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, FlowError> {
        let mut seen = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(FlowError::Dataset(format!("duplicate column '{dup}'")));
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(FlowError::Dataset(format!(
                "row {i} has {} cells, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    /// Parse CSV with a header row, inferring numbers and booleans
    ///
    /// # Errors
    /// Returns `FlowError::Dataset` if the CSV is malformed.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, FlowError> {
        let mut csv = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let columns: Vec<String> = csv
            .headers()
            .map_err(|e| FlowError::Dataset(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in csv.records() {
            let record = record.map_err(|e| FlowError::Dataset(e.to_string()))?;
            rows.push(record.iter().map(infer_cell).collect());
        }
        Self::new(columns, rows)
    }

    /// Column names in order
    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in order
    #[inline]
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// (rows, columns)
    #[inline]
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    /// Serialize as RFC 4180 CSV with a header row
    ///
    /// # Errors
    /// Returns `FlowError::Dataset` if writing fails.
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, FlowError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .map_err(|e| FlowError::Dataset(e.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(render_cell))
                .map_err(|e| FlowError::Dataset(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| FlowError::Dataset(e.to_string()))
    }

    /// Header plus the first `n` rows, for prompts
    #[must_use]
    pub fn preview(&self, n: usize) -> String {
        let mut out = self.columns.join(" | ");
        for row in self.rows.iter().take(n) {
            out.push('\n');
            out.push_str(&row.iter().map(render_cell).collect::<Vec<_>>().join(" | "));
        }
        out
    }

    /// Blake3 hex digest of columns and values
    #[must_use]
    pub fn content_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for column in &self.columns {
            hasher.update(column.as_bytes());
            hasher.update(&[0]);
        }
        for row in &self.rows {
            for cell in row {
                hasher.update(render_cell(cell).as_bytes());
                hasher.update(&[0]);
            }
            hasher.update(&[1]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn infer_cell(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match s.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn render_cell(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowMode {
    /// Stop after planning and wait for confirmation
    Planning,
    /// Plan (if enabled) and execute in one call
    #[default]
    Fast,
}

impl FromStr for FlowMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" => Ok(Self::Planning),
            "fast" => Ok(Self::Fast),
            other => Err(FlowError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Terminal status returned to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Request finished (successfully or not)
    Completed,
    /// Plan awaits explicit confirmation
    WaitingConfirmation,
}

impl Display for FlowStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::WaitingConfirmation => "waiting_confirmation",
        })
    }
}

/// One analysis request
#[derive(Debug, Clone)]
pub struct FlowRequest {
    /// Request ID
    pub id: RequestId,
    /// Natural-language instruction, or the approved plan when confirmed
    pub instruction: String,
    /// Dataset to analyze
    pub dataset: Arc<Dataset>,
    /// Planning or fast
    pub mode: FlowMode,
    /// Whether `instruction` is an already-approved plan
    pub is_confirmed_plan: bool,
    /// Catalog metadata stored with the interaction
    pub catalog: Option<Value>,
}

impl FlowRequest {
    /// Fast-mode request
    pub fn new(instruction: impl Into<String>, dataset: Arc<Dataset>) -> Self {
        Self {
            id: RequestId::new(),
            instruction: instruction.into(),
            dataset,
            mode: FlowMode::Fast,
            is_confirmed_plan: false,
            catalog: None,
        }
    }

    /// With mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: FlowMode) -> Self {
        self.mode = mode;
        self
    }

    /// Mark the instruction as an approved plan
    #[inline]
    #[must_use]
    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.is_confirmed_plan = confirmed;
        self
    }

    /// With catalog metadata
    #[inline]
    #[must_use]
    pub fn with_catalog(mut self, catalog: Value) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

/// One generate-and-run attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 1-based attempt number
    pub number: u32,
    /// Script that ran
    pub code: String,
    /// Narrative output, empty on error
    pub output: String,
    /// Base64 PNG, if produced
    pub image: Option<String>,
    /// Error text fed back to the next attempt
    pub error: Option<String>,
}

impl ExecutionAttempt {
    /// Whether the attempt failed
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Orchestrator response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    /// Request ID
    pub id: RequestId,
    /// Human-visible result text
    pub result: String,
    /// Final code, empty when planning or guarded
    pub code: String,
    /// Base64 PNG, if produced
    pub image: Option<String>,
    /// Reasoning trace extracted from the plan
    pub thought: Option<String>,
    /// Terminal status
    pub status: FlowStatus,
    /// Plan the code was generated from
    pub plan: Option<String>,
    /// Every attempt in order
    pub attempts: Vec<ExecutionAttempt>,
    /// Heuristic score of a successful result
    pub evaluation: Option<Evaluation>,
    /// Council reports
    pub reviews: Vec<ReviewReport>,
    /// Guardrail verdict on the final script
    pub guardrail: Option<GuardrailVerdict>,
}

impl FlowResponse {
    pub(crate) fn new(id: RequestId, status: FlowStatus) -> Self {
        Self {
            id,
            result: String::new(),
            code: String::new(),
            image: None,
            thought: None,
            status,
            plan: None,
            attempts: Vec::new(),
            evaluation: None,
            reviews: Vec::new(),
            guardrail: None,
        }
    }

    /// Decoded image bytes
    ///
    /// # Errors
    /// Returns `FlowError::Dataset` if the payload is not valid base64.
    pub fn image_bytes(&self) -> Result<Option<Vec<u8>>, FlowError> {
        self.image
            .as_deref()
            .map(|b64| {
                base64::engine::general_purpose::STANDARD
                    .decode(b64.trim())
                    .map_err(|e| FlowError::Dataset(format!("invalid image payload: {e}")))
            })
            .transpose()
    }

    /// Whether the guardrail rejected the script
    #[must_use]
    pub fn is_guarded(&self) -> bool {
        self.guardrail.as_ref().is_some_and(|g| !g.safe)
    }
}
