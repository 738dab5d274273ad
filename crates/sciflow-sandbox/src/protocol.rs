//! Sandbox boundary protocol
//!
//! The dataset is written to [`DATASET_PATH`] and the wrapped script to
//! [`SCRIPT_PATH`]. Stdout is the result channel; an optional base64 PNG is
//! embedded between [`PLOT_START`] and [`PLOT_END`].

use crate::backend::ExecOutput;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

/// Marker opening the embedded image payload
pub const PLOT_START: &str = "---PLOT_START---";
/// Marker closing the embedded image payload
pub const PLOT_END: &str = "---PLOT_END---";
/// Dataset location inside the sandbox
pub const DATASET_PATH: &str = "/tmp/data.csv";
/// Wrapper script location inside the sandbox
pub const SCRIPT_PATH: &str = "/tmp/executor.py";
/// Interpreter invocation
pub const RUN_ARGV: [&str; 2] = ["python", SCRIPT_PATH];

/// Wrap untrusted analysis code in the sandbox harness
///
/// The harness loads the dataset into `df`, runs the code inside a `try`
/// block, reports exceptions on stderr and prints any open figure as base64
/// between the plot markers.
#[must_use]
pub fn wrapper_script(code: &str) -> String {
    let mut out = String::with_capacity(code.len() + 640);
    out.push_str(
        "import sys\n\
         import io\n\
         import base64\n\
         import warnings\n\
         warnings.filterwarnings('ignore')\n\
         import pandas as pd\n\
         import numpy as np\n\
         import matplotlib\n\
         matplotlib.use('Agg')\n\
         import matplotlib.pyplot as plt\n\
         import seaborn as sns\n\
         \n",
    );
    let _ = writeln!(out, "df = pd.read_csv('{DATASET_PATH}')");
    out.push_str("\ntry:\n");
    for line in code.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            let _ = writeln!(out, "    {line}");
        }
    }
    out.push_str("    pass\n");
    out.push_str(
        "except Exception as e:\n    \
             print(f\"Error executing code: {e}\", file=sys.stderr)\n\
         \n\
         if plt.get_fignums():\n    \
             buf = io.BytesIO()\n    \
             plt.savefig(buf, format='png', bbox_inches='tight')\n    \
             buf.seek(0)\n",
    );
    let _ = writeln!(out, "    print('{PLOT_START}')");
    out.push_str("    print(base64.b64encode(buf.read()).decode('utf-8'))\n");
    let _ = writeln!(out, "    print('{PLOT_END}')");
    out.push_str("    plt.close('all')\n");
    out
}

/// Stdout split into narrative text and optional image payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedOutput {
    /// Narrative output outside the markers, trimmed
    pub text: String,
    /// Base64 image payload, if one was emitted
    pub image: Option<String>,
}

/// Strip the image payload out of `stdout`
///
/// A start marker without an end marker takes the remainder as payload.
#[must_use]
pub fn split_plot(stdout: &str) -> ParsedOutput {
    let Some(start) = stdout.find(PLOT_START) else {
        return ParsedOutput {
            text: stdout.trim().to_string(),
            image: None,
        };
    };
    let before = &stdout[..start];
    let rest = &stdout[start + PLOT_START.len()..];
    let (payload, after) = match rest.find(PLOT_END) {
        Some(end) => (&rest[..end], &rest[end + PLOT_END.len()..]),
        None => (rest, ""),
    };

    let text = [before.trim(), after.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let payload = payload.trim();
    ParsedOutput {
        text,
        image: (!payload.is_empty()).then(|| payload.to_string()),
    }
}

/// Why a run produced no usable output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunFailure {
    /// Script wrote to stderr or raised
    Script(String),
    /// Wall-clock deadline exceeded; the sandbox was killed
    Timeout(Duration),
    /// Backend failed while preparing or running the sandbox
    Sandbox(String),
}

impl RunFailure {
    /// Human-readable failure text
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Script(stderr) => stderr.clone(),
            Self::Timeout(d) => format!("Execution timed out after {}s", d.as_secs()),
            Self::Sandbox(msg) => format!("Sandbox failure: {msg}"),
        }
    }
}

/// Outcome of running one script in one sandbox
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Narrative stdout with the image stripped
    pub output: String,
    /// Base64 PNG, if a figure was produced
    pub image: Option<String>,
    /// Set when the run failed; output is then empty
    pub error: Option<RunFailure>,
}

impl RunOutcome {
    /// Failed outcome with no output
    #[inline]
    #[must_use]
    pub fn failed(failure: RunFailure) -> Self {
        Self {
            output: String::new(),
            image: None,
            error: Some(failure),
        }
    }

    /// Whether the script ran cleanly
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Error text prefixed with `Error: `, if the run failed
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(|f| format!("Error: {}", f.message()))
    }

    /// Text shown to the user: output on success, error text otherwise
    #[must_use]
    pub fn display_text(&self) -> String {
        self.error_text().unwrap_or_else(|| self.output.clone())
    }
}

/// Turn raw sandbox output into a run outcome
///
/// Any stderr wins over stdout: partial output is never returned alongside an
/// error.
#[must_use]
pub fn interpret(exec: ExecOutput) -> RunOutcome {
    let stderr = exec.stderr.trim();
    if !stderr.is_empty() {
        return RunOutcome::failed(RunFailure::Script(stderr.to_string()));
    }
    if let Some(code) = exec.exit_code.filter(|c| *c != 0) {
        return RunOutcome::failed(RunFailure::Script(format!(
            "interpreter exited with status {code}"
        )));
    }
    let parsed = split_plot(&exec.stdout);
    RunOutcome {
        output: parsed.text,
        image: parsed.image,
        error: None,
    }
}
