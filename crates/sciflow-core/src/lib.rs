//! Sciflow Core - self-correcting analysis orchestrator
//!
//! A request becomes a verified, bounded side effect:
//! - Plan (cached per instruction and dataset shape), optionally stopping
//!   for confirmation
//! - Generate code and run it in a disposable sandbox, retrying with the
//!   previous error on failure
//! - Vet the script, score the result and collect council findings
//! - Persist the interaction to working memory
//!
//! # Example
//!
//! ```rust,ignore
//! use sciflow_core::{Dataset, FlowConfig, FlowRequest, HttpGenerator, ScientificFlow};
//! use sciflow_memory::WorkingMemory;
//! use sciflow_sandbox::{DockerCliBackend, SandboxPool};
//! use std::sync::Arc;
//!
//! # async fn example(dataset: Dataset) -> Result<(), sciflow_core::FlowError> {
//! let config = FlowConfig::load(None)?;
//! let pool = SandboxPool::initialize(Arc::new(DockerCliBackend::default()), config.sandbox.pool_config()?).await;
//! let coder = Arc::new(HttpGenerator::new(config.model.clone(), config.generation_timeout())?);
//! let flow = ScientificFlow::new(config, coder, pool, Arc::new(WorkingMemory::in_memory()));
//!
//! let response = flow.run(FlowRequest::new("Sum column A", Arc::new(dataset))).await?;
//! println!("{}", response.result);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod flow;
pub mod generator;
pub mod prompts;
pub mod state;
pub mod types;

pub use config::{CacheKeyMode, FlowConfig, ModelConfig, Provider, SandboxConfig};
pub use error::{FlowError, GenerationError};
pub use flow::{ScientificFlow, FALLBACK_PLAN};
pub use generator::{CodeGenerator, HttpGenerator};
pub use state::{FlowMachine, FlowState};
pub use types::{
    Dataset, ExecutionAttempt, FlowMode, FlowRequest, FlowResponse, FlowStatus, RequestId,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
