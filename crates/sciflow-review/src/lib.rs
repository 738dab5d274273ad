//! Sciflow Review - vetting of generated analysis code and results
//!
//! - [`GuardrailAgent`]: denylist scan and plan/code alignment audit
//! - [`Evaluator`]: heuristic result score and code-quality audit
//! - [`TheCouncil`]: independent specialists annotating plan, code and result
//!
//! Everything here is stateless and synchronous.

pub mod council;
pub mod evaluator;
pub mod guardrail;

pub use council::{
    Architect, CouncilVerdict, ReviewReport, Specialist, Statistician, Submission, TheCouncil,
    Visualizer,
};
pub use evaluator::{CodeQuality, EvalStatus, Evaluation, Evaluator, QualityRating};
pub use guardrail::{GuardrailAgent, GuardrailVerdict};
