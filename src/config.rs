//! Research configuration

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hard ceiling on follow-up rounds after the initial round
pub const MAX_FOLLOW_UP_ROUNDS: u8 = 2;
/// Hard ceiling on tasks produced by decomposition
pub const MAX_DECOMPOSED_TASKS: usize = 4;
/// Hard ceiling on concurrent tool calls inside one worker
pub const MAX_FAN_OUT: usize = 6;

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Per-worker tool-call settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent tool calls inside one worker
    pub fan_out: usize,
    pub searches_per_task: usize,
    pub results_per_search: usize,
    pub max_fetches: usize,
    pub call_timeout_ms: u64,
    pub max_insights: usize,
    /// Country code for localized search results
    pub country: String,
    /// Language of search results
    pub search_lang: String,
    /// Extra headers sent with every fetch
    pub fetch_headers: BTreeMap<String, String>,
    /// Tool-call level retries
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fan_out: 3,
            searches_per_task: 2,
            results_per_search: 10,
            max_fetches: 3,
            call_timeout_ms: 30_000,
            max_insights: 8,
            country: "us".into(),
            search_lang: "en".into(),
            fetch_headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Fan-out clamped to the supported range
    pub fn effective_fan_out(&self) -> usize {
        self.fan_out.clamp(1, MAX_FAN_OUT)
    }
}

/// Request-level orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Workers running at once within a round
    pub concurrency_limit: usize,
    pub max_follow_up_rounds: u8,
    pub max_tasks: usize,
    /// Task-level retries after the first attempt
    pub task_retries: u32,
    pub task_backoff: RetryPolicy,
    pub worker_timeout_ms: u64,
    /// Whole-request deadline, 0 disables it
    pub request_timeout_ms: u64,
    /// Outbound tool calls in flight across all workers of a request
    pub rate_limit: usize,
    pub worker: WorkerConfig,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            max_follow_up_rounds: MAX_FOLLOW_UP_ROUNDS,
            max_tasks: MAX_DECOMPOSED_TASKS,
            task_retries: 2,
            task_backoff: RetryPolicy::default(),
            worker_timeout_ms: 120_000,
            request_timeout_ms: 600_000,
            rate_limit: 4,
            worker: WorkerConfig::default(),
        }
    }
}

impl ResearchConfig {
    /// Parse from TOML; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be at least 1".into()));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::Invalid("rate_limit must be at least 1".into()));
        }
        if self.max_tasks == 0 {
            return Err(ConfigError::Invalid("max_tasks must be at least 1".into()));
        }
        if self.worker.call_timeout_ms == 0 || self.worker_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.task_backoff.backoff_multiplier < 1.0 || self.worker.retry.backoff_multiplier < 1.0
        {
            return Err(ConfigError::Invalid("backoff_multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Follow-up rounds actually allowed, never above the hard ceiling
    pub fn follow_up_rounds(&self) -> u8 {
        self.max_follow_up_rounds.min(MAX_FOLLOW_UP_ROUNDS)
    }

    pub fn task_limit(&self) -> usize {
        self.max_tasks.clamp(1, MAX_DECOMPOSED_TASKS)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Task-level retry policy
    pub fn task_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.task_retries,
            ..self.task_backoff.clone()
        }
    }
}
