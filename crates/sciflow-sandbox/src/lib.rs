//! Sciflow Sandbox - isolated execution pool
//!
//! Runs untrusted analysis scripts in disposable, resource-capped,
//! network-disabled sandboxes:
//! - A warm pool sized by deployment profile
//! - One script per sandbox; every sandbox is destroyed after its run
//! - Crash recovery by pruning sandboxes carrying the ownership label
//! - Wall-clock deadlines and cancellation that kill the running sandbox
//!
//! # Example
//!
//! ```rust,ignore
//! use sciflow_sandbox::{DeploymentProfile, DockerCliBackend, PoolConfig, SandboxPool};
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn example() -> Result<(), sciflow_sandbox::SandboxError> {
//! let backend = Arc::new(DockerCliBackend::default());
//! let pool = SandboxPool::initialize(backend, PoolConfig::from_profile(DeploymentProfile::Laptop)).await;
//!
//! let outcome = pool.run("print(df['A'].sum())", b"A\n1\n2\n3\n", Duration::from_secs(30)).await?;
//! println!("{}", outcome.display_text());
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod limits;
pub mod pool;
pub mod protocol;
pub mod sandbox;

pub use backend::{BackendHandle, DockerCliBackend, ExecOutput, SandboxBackend};
pub use error::SandboxError;
pub use limits::{DeploymentProfile, ResourceLimits};
pub use pool::{prune_orphans, PoolConfig, PoolStats, SandboxLease, SandboxPool};
pub use protocol::{RunFailure, RunOutcome};
pub use sandbox::{OwnerLabel, Sandbox, SandboxId, SandboxState};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
