//! Resource limits and deployment profiles
//!
//! A deployment profile sizes the warm pool and the per-sandbox caps for the
//! host class the service runs on.

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Per-sandbox resource ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MB
    pub memory_mb: u64,
    /// CPU quota in millicores (1000 = one core)
    pub cpu_millicores: u64,
    /// Maximum number of processes inside the sandbox
    pub pids_limit: u64,
    /// Whether networking is disabled
    pub network_disabled: bool,
}

impl ResourceLimits {
    /// Create limits with networking disabled
    #[inline]
    #[must_use]
    pub fn new(memory_mb: u64, cpu_millicores: u64) -> Self {
        Self {
            memory_mb,
            cpu_millicores,
            pids_limit: 128,
            network_disabled: true,
        }
    }

    /// With a process limit
    #[inline]
    #[must_use]
    pub fn with_pids_limit(mut self, pids_limit: u64) -> Self {
        self.pids_limit = pids_limit;
        self
    }

    /// CPU quota rendered as fractional cores, e.g. `0.5`
    #[must_use]
    pub fn cpus(&self) -> String {
        let whole = self.cpu_millicores / 1000;
        let frac = self.cpu_millicores % 1000;
        if frac == 0 {
            format!("{whole}")
        } else {
            format!("{whole}.{}", format!("{frac:03}").trim_end_matches('0'))
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        DeploymentProfile::default().limits()
    }
}

/// Host class the service is deployed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentProfile {
    /// Constrained single-user host
    Laptop,
    /// Shared server
    #[default]
    Server,
    /// Dedicated server-class host
    Cluster,
}

impl DeploymentProfile {
    /// Number of warm sandboxes kept ready
    #[inline]
    #[must_use]
    pub fn capacity(self) -> usize {
        match self {
            Self::Laptop => 1,
            Self::Server => 3,
            Self::Cluster => 5,
        }
    }

    /// Resource caps applied to each sandbox
    #[inline]
    #[must_use]
    pub fn limits(self) -> ResourceLimits {
        match self {
            Self::Laptop => ResourceLimits::new(512, 500),
            Self::Server | Self::Cluster => ResourceLimits::new(2048, 1000),
        }
    }
}

impl Display for DeploymentProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Laptop => "laptop",
            Self::Server => "server",
            Self::Cluster => "cluster",
        };
        f.write_str(name)
    }
}

impl FromStr for DeploymentProfile {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "laptop" => Ok(Self::Laptop),
            "server" => Ok(Self::Server),
            "cluster" => Ok(Self::Cluster),
            other => Err(SandboxError::UnknownProfile(other.to_string())),
        }
    }
}
