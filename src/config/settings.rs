use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{EnactorError, Result};
use crate::ledger::CompensationOptions;
use crate::retry::{BackoffShape, FaultClassification, RetryPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnactorConfig {
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub escalation: EscalationConfig,
    pub events: EventsConfig,
}

impl EnactorConfig {
    pub async fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = config_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| EnactorError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        // Retry validation
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be greater than 0");
        }
        if self.retry.initial_delay_ms == 0 {
            errors.push("retry.initial_delay_ms must be greater than 0");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            errors.push("retry.max_delay_ms must be >= initial_delay_ms");
        }
        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            errors.push("retry.jitter_fraction must be between 0.0 and 1.0");
        }
        if self.retry.timeout_secs == 0 {
            errors.push("retry.timeout_secs must be greater than 0");
        }

        // Cache validation
        if self.cache.capacity == 0 {
            errors.push("cache.capacity must be greater than 0");
        }
        if self.cache.hot_threshold == 0 {
            errors.push("cache.hot_threshold must be greater than 0");
        }
        if self.cache.default_ttl_secs == 0 {
            errors.push("cache.default_ttl_secs must be greater than 0");
        }
        if self.cache.sweep_interval_secs == 0 {
            errors.push("cache.sweep_interval_secs must be greater than 0");
        }

        // Ledger validation
        if self.ledger.timeout_per_action_secs == 0 {
            errors.push("ledger.timeout_per_action_secs must be greater than 0");
        }

        // Events validation
        if self.events.channel_capacity == 0 {
            errors.push("events.channel_capacity must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EnactorError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub backoff_shape: BackoffShape,
    pub jitter_fraction: f64,
    /// Classifications eligible for retry; everything else fails fast.
    pub retryable: Vec<FaultClassification>,
    pub timeout_secs: u64,
    pub allow_auth_refresh: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            multiplier: defaults.multiplier,
            backoff_shape: defaults.backoff_shape,
            jitter_fraction: defaults.jitter_fraction,
            retryable: defaults.retryable_classifications,
            timeout_secs: defaults.timeout.as_secs(),
            allow_auth_refresh: defaults.allow_auth_refresh,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_backoff_shape(self.backoff_shape)
            .with_jitter_fraction(self.jitter_fraction)
            .with_retryable(self.retryable.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_auth_refresh(self.allow_auth_refresh)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Hit count at which a record is marked hot and persisted.
    pub hot_threshold: u32,
    pub default_ttl_secs: u64,
    /// Per-action-type TTL overrides in seconds.
    pub ttl_overrides: HashMap<String, u64>,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            hot_threshold: 3,
            default_ttl_secs: 3600,
            ttl_overrides: HashMap::new(),
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, action_type: &str) -> Duration {
        let secs = self
            .ttl_overrides
            .get(action_type)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub stop_on_failure: bool,
    pub require_confirmation: bool,
    /// Upper bound on actions compensated per run (0 = unlimited).
    pub max_compensation_actions: usize,
    pub timeout_per_action_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            require_confirmation: true,
            max_compensation_actions: 0,
            timeout_per_action_secs: 30,
        }
    }
}

impl LedgerConfig {
    pub fn to_options(&self) -> CompensationOptions {
        let mut options = CompensationOptions::default()
            .with_stop_on_failure(self.stop_on_failure)
            .with_require_confirmation(self.require_confirmation)
            .with_timeout_per_action(Duration::from_secs(self.timeout_per_action_secs));
        if self.max_compensation_actions > 0 {
            options = options.with_max_actions(self.max_compensation_actions);
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Approve low-risk requests instead of expiring them at deadline.
    pub auto_approve_low_on_expiry: bool,
    /// Reject high- and critical-risk requests instead of expiring them at deadline.
    pub auto_reject_high_on_expiry: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            auto_approve_low_on_expiry: false,
            auto_reject_high_on_expiry: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}
