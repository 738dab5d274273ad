//! Pulling code and reasoning traces out of raw model text

use once_cell::sync::Lazy;
use regex::Regex;

static PYTHON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```python\s*(.*?)```").expect("python block pattern is valid"));
static ANY_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```\s*(.*?)```").expect("fenced block pattern is valid"));
static THOUGHT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(thought|think)>(.*?)</(?:thought|think)>").expect("thought pattern is valid")
});

fn first_capture<'a>(re: &Regex, text: &'a str, group: usize) -> Option<&'a str> {
    re.captures(text)
        .and_then(|c| c.get(group))
        .map(|m| m.as_str())
}

/// Extract the script from a model response
///
/// Prefers the first ```` ```python ```` block, then any fenced block, then
/// the whole response. A leading bare `python` token is dropped.
#[must_use]
pub fn extract_code(response: &str) -> String {
    let code = first_capture(&PYTHON_BLOCK, response, 1)
        .or_else(|| first_capture(&ANY_BLOCK, response, 1))
        .unwrap_or(response)
        .trim();
    match code.strip_prefix("python") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
            rest.trim().to_string()
        }
        _ => code.to_string(),
    }
}

/// Split a plan into (plan text, reasoning trace)
///
/// Every `<thought>`/`<think>` section is removed from the plan; their
/// contents are joined into the trace.
#[must_use]
pub fn split_thought(plan: &str) -> (String, Option<String>) {
    let thoughts: Vec<&str> = THOUGHT
        .captures_iter(plan)
        .filter_map(|c| c.get(2))
        .map(|m| m.as_str().trim())
        .filter(|t| !t.is_empty())
        .collect();
    let stripped = THOUGHT.replace_all(plan, "").trim().to_string();
    let thought = (!thoughts.is_empty()).then(|| thoughts.join("\n"));
    (stripped, thought)
}
