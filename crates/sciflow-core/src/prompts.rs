//! Prompt builders

use crate::types::Dataset;
use std::fmt::Write as _;

/// Rows shown in prompt previews
pub const PREVIEW_ROWS: usize = 3;

fn dataset_context(dataset: &Dataset) -> String {
    let (rows, cols) = dataset.shape();
    format!(
        "Dataset Overview:\nColumns: {}\nShape: {rows} rows x {cols} columns\n\nFirst {PREVIEW_ROWS} rows:\n{}\n",
        dataset.columns().join(", "),
        dataset.preview(PREVIEW_ROWS)
    )
}

/// Prompt asking for an analysis plan without code
#[must_use]
pub fn planning_prompt(instruction: &str, dataset: &Dataset, memory_context: &str) -> String {
    let mut prompt = String::from(
        "You are a Senior Data Scientist.\n\
         Your goal is to PLAN an analysis based on the user's request.\n\
         Do NOT write code yet. Just describe the steps you would take.\n\n",
    );
    prompt.push_str(&dataset_context(dataset));
    if !memory_context.is_empty() {
        prompt.push_str(memory_context);
    }
    let _ = write!(
        prompt,
        "\nInstruction: {instruction}\n\n\
         Guidelines:\n\
         1. Think about statistical assumptions (normality, missing values).\n\
         2. Propose specific, numbered steps.\n\
         3. Be concise.\n\nPlan:\n"
    );
    prompt
}

/// Instruction combining the request with its approved plan
#[must_use]
pub fn augmented_instruction(instruction: &str, plan: &str) -> String {
    format!(
        "User Request: {instruction}\n\nApproved Plan:\n{plan}\n\nPlease execute this plan using Python."
    )
}

/// Prompt asking for code, with the previous attempt's error if any
#[must_use]
pub fn code_prompt(instruction: &str, dataset: &Dataset, previous_error: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are an expert Data Scientist and Python Programmer.\n\
         Write Python code to analyze a dataset based on the user's instruction.\n\n",
    );
    prompt.push_str(&dataset_context(dataset));
    let _ = write!(
        prompt,
        "\nInstruction: {instruction}\n\n\
         Guidelines:\n\
         1. The dataframe is already loaded as 'df'; do not reload or overwrite it.\n\
         2. Use pandas, numpy, matplotlib and seaborn as needed.\n\
         3. Print every value the user asked for so it can be captured.\n\
         4. For plots, create the figure; do not call plt.show().\n\
         5. Return ONLY a python code block.\n"
    );
    if let Some(error) = previous_error {
        let _ = write!(
            prompt,
            "\nYour previous attempt failed with:\n{error}\nFix the problem and return corrected code.\n"
        );
    }
    prompt.push_str("\nResponse:\n");
    prompt
}
