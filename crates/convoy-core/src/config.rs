//! Configuration for the orchestration core.
//!
//! Defaults are built in; an optional `convoy.yml` overrides them, and
//! `CONVOY_*` environment variables override both. Malformed numeric env
//! values are warned about and ignored rather than failing startup.

use crate::retry::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_ITERATIONS,
    DEFAULT_TOKEN_LIMIT, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".convoy";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file failed to parse.
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyConfig {
    /// Directory holding all persisted state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Command line for the agent runtime (feature description appended).
    #[serde(default)]
    pub agent_command: Option<String>,

    /// Retry/backoff parameters for feature loops.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker parameters.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Batch orchestration limits.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Completion verifier parameters (independent of feature retries).
    #[serde(default)]
    pub verifier: VerifierConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            agent_command: None,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            verifier: VerifierConfig::default(),
        }
    }
}

/// Retry/backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per retry loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the computed delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Cumulative token budget per loop.
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_ratio() -> f64 {
    DEFAULT_JITTER_RATIO
}
fn default_token_limit() -> u64 {
    DEFAULT_TOKEN_LIMIT
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            token_limit: default_token_limit(),
        }
    }
}

impl RetryConfig {
    /// Builds the policy object the core components consume.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_iterations: self.max_iterations,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            token_limit: self.token_limit,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
}

fn default_breaker_threshold() -> u32 {
    crate::circuit_breaker::DEFAULT_BREAKER_THRESHOLD
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
        }
    }
}

/// Batch orchestration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry cap per individual feature.
    #[serde(default = "default_max_retries_per_feature")]
    pub max_retries_per_feature: u32,

    /// Retry ceiling across the whole batch.
    #[serde(default = "default_global_retry_limit")]
    pub global_retry_limit: u32,

    /// Reorder features by declared dependencies before execution.
    #[serde(default = "default_true")]
    pub dependency_ordering: bool,
}

fn default_max_retries_per_feature() -> u32 {
    3
}
fn default_global_retry_limit() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_feature: default_max_retries_per_feature(),
            global_retry_limit: default_global_retry_limit(),
            dependency_ordering: true,
        }
    }
}

/// Completion verifier parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Maximum loop-back retries per session.
    #[serde(default = "default_max_iterations")]
    pub max_loop_backs: u32,

    /// Breaker threshold for the verifier's own loop.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_loop_backs: default_max_iterations(),
            breaker_threshold: default_breaker_threshold(),
        }
    }
}

impl ConvoyConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Loads from an explicit path, from `convoy.yml` if present, or defaults.
    ///
    /// Environment overrides are applied on top in every case.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new("convoy.yml");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Applies `CONVOY_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup (injectable for tests).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CONVOY_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = lookup("CONVOY_AGENT_CMD") {
            self.agent_command = Some(cmd);
        }
        override_num(&lookup, "CONVOY_MAX_ITERATIONS", &mut self.retry.max_iterations);
        override_num(&lookup, "CONVOY_BASE_DELAY_MS", &mut self.retry.base_delay_ms);
        override_num(&lookup, "CONVOY_MAX_DELAY_MS", &mut self.retry.max_delay_ms);
        override_num(&lookup, "CONVOY_TOKEN_LIMIT", &mut self.retry.token_limit);
        override_num(&lookup, "CONVOY_BREAKER_THRESHOLD", &mut self.breaker.threshold);
        override_num(
            &lookup,
            "CONVOY_MAX_RETRIES_PER_FEATURE",
            &mut self.orchestrator.max_retries_per_feature,
        );
        override_num(
            &lookup,
            "CONVOY_GLOBAL_RETRY_LIMIT",
            &mut self.orchestrator.global_retry_limit,
        );
    }

    /// Policy for the verifier's independent loop-back retries.
    pub fn verifier_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_iterations: self.verifier.max_loop_backs,
            ..self.retry.policy()
        }
    }
}

fn override_num<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: std::str::FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => {
                let kept = *slot;
                warn!(key, value = %raw, kept = %kept, "Ignoring malformed env override");
            }
        }
    }
}
