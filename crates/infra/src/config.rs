//! Pipeline configuration.
//!
//! Defaults suit local development; `PipelineConfig::from_env` overrides any
//! value from `CONTENTFORGE_*` environment variables and validates the result.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use contentforge_core::StepKind;

pub const ENV_PREFIX: &str = "CONTENTFORGE_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Backoff strategy between transient step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy for transient generation failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per step and run, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Single attempt, failures are permanent straight away.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after the failed `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt may follow the failed `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Estimated token cost per step, used to size reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEstimates {
    pub idea_generation: u64,
    pub copy_design: u64,
    pub base_image: u64,
    pub final_design: u64,
}

impl Default for StepEstimates {
    fn default() -> Self {
        Self {
            idea_generation: 10,
            copy_design: 20,
            base_image: 15,
            final_design: 5,
        }
    }
}

impl StepEstimates {
    pub fn get(&self, step: StepKind) -> u64 {
        match step {
            StepKind::IdeaGeneration => self.idea_generation,
            StepKind::CopyDesign => self.copy_design,
            StepKind::BaseImage => self.base_image,
            StepKind::FinalDesign => self.final_design,
        }
    }

    pub fn set(&mut self, step: StepKind, tokens: u64) {
        match step {
            StepKind::IdeaGeneration => self.idea_generation = tokens,
            StepKind::CopyDesign => self.copy_design = tokens,
            StepKind::BaseImage => self.base_image = tokens,
            StepKind::FinalDesign => self.final_design = tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    /// Upper bound for a single generation call.
    pub step_timeout: Duration,
    pub max_concurrent_jobs_per_agency: usize,
    pub step_estimates: StepEstimates,
    /// Currency units per token, used for cost reporting only.
    pub token_rate: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(60),
            max_concurrent_jobs_per_agency: 4,
            step_estimates: StepEstimates::default(),
            token_rate: 0.002,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `CONTENTFORGE_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some(v) = var("MAX_ATTEMPTS") {
            config.retry.max_attempts = parse(v)?;
        }
        if let Some(v) = var("BACKOFF_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(parse(v)?);
        }
        if let Some(v) = var("BACKOFF_MAX_MS") {
            config.retry.max_delay = Duration::from_millis(parse(v)?);
        }
        if let Some(v) = var("BACKOFF_STRATEGY") {
            config.retry.strategy = match v.1.to_ascii_lowercase().as_str() {
                "fixed" => BackoffStrategy::Fixed,
                "exponential" => BackoffStrategy::Exponential,
                "linear" => BackoffStrategy::Linear,
                _ => return Err(ConfigError::InvalidValue { var: v.0, value: v.1 }),
            };
        }
        if let Some(v) = var("STEP_TIMEOUT_MS") {
            config.step_timeout = Duration::from_millis(parse(v)?);
        }
        if let Some(v) = var("MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs_per_agency = parse(v)?;
        }
        if let Some(v) = var("TOKEN_RATE") {
            config.token_rate = parse(v)?;
        }
        for step in StepKind::ALL {
            if let Some(v) = var(&format!("ESTIMATE_{}", step.as_str())) {
                config.step_estimates.set(step, parse(v)?);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation("max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Validation(
                "backoff base delay exceeds max delay".into(),
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(ConfigError::Validation("step_timeout must be positive".into()));
        }
        if self.max_concurrent_jobs_per_agency == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_jobs_per_agency must be at least 1".into(),
            ));
        }
        // Reservations are sized from these, and the ledger never holds zero tokens.
        if let Some(step) = StepKind::ALL.into_iter().find(|k| self.step_estimates.get(*k) == 0) {
            return Err(ConfigError::Validation(format!("estimate for {step} must be at least 1 token")));
        }
        if !self.token_rate.is_finite() || self.token_rate < 0.0 {
            return Err(ConfigError::Validation("token_rate must be a non-negative number".into()));
        }
        Ok(())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs_per_agency = max;
        self
    }

    pub fn with_step_estimates(mut self, estimates: StepEstimates) -> Self {
        self.step_estimates = estimates;
        self
    }

    /// Cost of `tokens` at the configured rate.
    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 * self.token_rate
    }
}

fn parse<T: core::str::FromStr>((var, value): (String, String)) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}
