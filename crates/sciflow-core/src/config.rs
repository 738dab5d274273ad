//! Orchestrator configuration
//!
//! Loaded from TOML, then overlaid with `SCIFLOW_*` environment variables.

use crate::error::FlowError;
use sciflow_sandbox::{DeploymentProfile, OwnerLabel, PoolConfig, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How plan-cache keys are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKeyMode {
    /// Instruction, columns and shape
    #[default]
    Shape,
    /// Also the dataset contents
    Content,
}

/// Model server flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Ollama `/api/generate`
    #[default]
    Ollama,
    /// OpenAI-compatible `/v1/chat/completions`
    OpenAi,
}

/// Code-generation collaborator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Server flavor
    pub provider: Provider,
    /// Server base URL, without a trailing path
    pub base_url: String,
    /// Model name
    pub model: String,
    /// Bearer token for OpenAI-compatible servers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens generated per call
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "deepseek-r1".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

/// Sandbox pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Host class; sizes the pool and the caps
    pub profile: DeploymentProfile,
    /// Overrides the profile's capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// Overrides the profile's memory ceiling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Overrides the profile's CPU quota
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u64>,
    /// Sandbox image
    pub image: String,
    /// `key=value` label marking sandboxes owned by this service
    pub owner_label: String,
    /// Disable networking inside sandboxes
    pub network_disabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            profile: DeploymentProfile::default(),
            capacity: None,
            memory_mb: None,
            cpu_millicores: None,
            image: sciflow_sandbox::backend::docker::DEFAULT_IMAGE.to_string(),
            owner_label: OwnerLabel::default().to_string(),
            network_disabled: true,
        }
    }
}

impl SandboxConfig {
    /// Pool configuration: the profile with overrides applied
    ///
    /// # Errors
    /// Returns `FlowError::Config` for a malformed owner label or zero capacity.
    pub fn pool_config(&self) -> Result<PoolConfig, FlowError> {
        let label: OwnerLabel = self
            .owner_label
            .parse()
            .map_err(|e| FlowError::Config(format!("{e}")))?;
        let base = self.profile.limits();
        let mut limits = ResourceLimits::new(
            self.memory_mb.unwrap_or(base.memory_mb),
            self.cpu_millicores.unwrap_or(base.cpu_millicores),
        )
        .with_pids_limit(base.pids_limit);
        limits.network_disabled = self.network_disabled;

        let capacity = self.capacity.unwrap_or_else(|| self.profile.capacity());
        if capacity == 0 {
            return Err(FlowError::Config("sandbox capacity must be at least 1".into()));
        }
        Ok(PoolConfig::from_profile(self.profile)
            .with_capacity(capacity)
            .with_limits(limits)
            .with_owner_label(label))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Produce a plan before generating code
    pub planning_enabled: bool,
    /// Extra attempts after the first failed one
    pub max_retries: u32,
    /// Wall-clock bound on one sandboxed run
    pub execution_timeout_secs: u64,
    /// Bound on one generation call
    pub generation_timeout_secs: u64,
    /// Plans kept in the cache
    pub cache_capacity: u64,
    /// Plan-cache key derivation
    pub cache_key_mode: CacheKeyMode,
    /// Working-memory file
    pub memory_path: PathBuf,
    /// Past interactions included in planning prompts
    pub memory_context_limit: usize,
    /// Sandbox pool
    pub sandbox: SandboxConfig,
    /// Model server
    pub model: ModelConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            planning_enabled: true,
            max_retries: 2,
            execution_timeout_secs: 30,
            generation_timeout_secs: 120,
            cache_capacity: sciflow_memory::cache::DEFAULT_CAPACITY,
            cache_key_mode: CacheKeyMode::Shape,
            memory_path: PathBuf::from("data/memory.json"),
            memory_context_limit: sciflow_memory::working::DEFAULT_CONTEXT_LIMIT,
            sandbox: SandboxConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Load from `path` (defaults when `None`), then apply the environment
    ///
    /// # Errors
    /// Returns `FlowError::Config` if the file cannot be read or parsed, or an
    /// environment override is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, FlowError> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    FlowError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_env()
    }

    /// Parse TOML; missing keys take their defaults
    ///
    /// # Errors
    /// Returns `FlowError::Config` on invalid TOML.
    pub fn from_toml(content: &str) -> Result<Self, FlowError> {
        toml::from_str(content).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns `FlowError::Config` if serialization fails.
    pub fn to_toml(&self) -> Result<String, FlowError> {
        toml::to_string_pretty(self).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Overlay `SCIFLOW_*` process environment variables
    ///
    /// # Errors
    /// Returns `FlowError::Config` if a variable cannot be parsed.
    pub fn apply_env(self) -> Result<Self, FlowError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables resolved through `lookup`
    ///
    /// # Errors
    /// Returns `FlowError::Config` if a variable cannot be parsed.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, FlowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SCIFLOW_PROFILE") {
            self.sandbox.profile = v
                .parse()
                .map_err(|e| FlowError::Config(format!("SCIFLOW_PROFILE: {e}")))?;
        }
        if let Some(v) = lookup("SCIFLOW_MAX_RETRIES") {
            self.max_retries = v
                .trim()
                .parse()
                .map_err(|e| FlowError::Config(format!("SCIFLOW_MAX_RETRIES: {e}")))?;
        }
        if let Some(v) = lookup("SCIFLOW_PLANNING") {
            self.planning_enabled = parse_flag(&v)
                .ok_or_else(|| FlowError::Config(format!("SCIFLOW_PLANNING: '{v}' is not a boolean")))?;
        }
        if let Some(v) = lookup("SCIFLOW_MODEL") {
            self.model.model = v;
        }
        if let Some(v) = lookup("SCIFLOW_MODEL_URL") {
            self.model.base_url = v;
        }
        if let Some(v) = lookup("SCIFLOW_API_KEY") {
            self.model.api_key = Some(v);
        }
        if let Some(v) = lookup("SCIFLOW_MEMORY_PATH") {
            self.memory_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCIFLOW_SANDBOX_IMAGE") {
            self.sandbox.image = v;
        }
        Ok(self)
    }

    /// With planning on or off
    #[inline]
    #[must_use]
    pub fn with_planning(mut self, enabled: bool) -> Self {
        self.planning_enabled = enabled;
        self
    }

    /// With a retry bound
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// With an execution timeout
    ///
    /// Timeouts are kept in whole seconds: a partial second rounds up, so the
    /// bound is never shorter than requested, and the minimum is one second.
    #[inline]
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_secs = whole_secs_ceil(timeout);
        self
    }

    /// With a generation timeout, rounded up to whole seconds
    #[inline]
    #[must_use]
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_secs = whole_secs_ceil(timeout);
        self
    }

    /// With a cache key mode
    #[inline]
    #[must_use]
    pub fn with_cache_key_mode(mut self, mode: CacheKeyMode) -> Self {
        self.cache_key_mode = mode;
        self
    }

    /// With a memory file
    #[inline]
    #[must_use]
    pub fn with_memory_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.memory_path = path.into();
        self
    }

    /// With model settings
    #[inline]
    #[must_use]
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    /// With sandbox settings
    #[inline]
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Execution timeout as a duration
    #[inline]
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Generation timeout as a duration
    #[inline]
    #[must_use]
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Total attempts per request
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

fn whole_secs_ceil(d: Duration) -> u64 {
    (d.as_secs() + u64::from(d.subsec_nanos() > 0)).max(1)
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
