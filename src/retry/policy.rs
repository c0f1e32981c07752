//! Retry policies and the per-target policy registry.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::backoff::BackoffShape;
use super::classify::FaultClassification;

/// Everything the retry loop needs to know for one target.
///
/// `retryable_classifications` is the whitelist consulted after
/// classification; Validation and Unclassified are absent from every
/// built-in policy on purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub backoff_shape: BackoffShape,
    pub jitter_fraction: f64,
    pub retryable_classifications: Vec<FaultClassification>,
    /// Per-attempt budget; exceeding it classifies the attempt as Timeout.
    pub timeout: Duration,
    pub allow_auth_refresh: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            backoff_shape: BackoffShape::Exponential,
            jitter_fraction: 0.1,
            retryable_classifications: FaultClassification::default_retryable().to_vec(),
            timeout: Duration::from_secs(30),
            allow_auth_refresh: true,
        }
    }
}

impl RetryPolicy {
    /// Wider limits for targets that throttle hard but recover.
    pub fn patient() -> Self {
        Self {
            max_attempts: 5,
            max_delay: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Single extra attempt, short waits. Suited to interactive paths.
    pub fn tight() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_backoff_shape(mut self, shape: BackoffShape) -> Self {
        self.backoff_shape = shape;
        self
    }

    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_retryable(mut self, classifications: Vec<FaultClassification>) -> Self {
        self.retryable_classifications = classifications;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_refresh(mut self, allow: bool) -> Self {
        self.allow_auth_refresh = allow;
        self
    }

    pub fn is_retryable(&self, classification: FaultClassification) -> bool {
        self.retryable_classifications.contains(&classification)
    }
}

/// Per-target policy overrides with a shared fallback.
///
/// Lookup clones; policies are small and callers hold them across awaits.
#[derive(Debug)]
pub struct PolicyRegistry {
    fallback: RetryPolicy,
    per_target: RwLock<HashMap<String, RetryPolicy>>,
}

impl PolicyRegistry {
    pub fn new(fallback: RetryPolicy) -> Self {
        Self {
            fallback,
            per_target: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, target: impl Into<String>, policy: RetryPolicy) {
        self.per_target.write().insert(target.into(), policy);
    }

    pub fn remove(&self, target: &str) -> Option<RetryPolicy> {
        self.per_target.write().remove(target)
    }

    pub fn policy_for(&self, target: &str) -> RetryPolicy {
        self.per_target
            .read()
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn fallback(&self) -> &RetryPolicy {
        &self.fallback
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_never_retries_validation_or_unclassified() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(FaultClassification::Validation));
        assert!(!policy.is_retryable(FaultClassification::Unclassified));
        assert!(!policy.is_retryable(FaultClassification::Authorization));
        assert!(policy.is_retryable(FaultClassification::RateLimited));
        assert!(policy.is_retryable(FaultClassification::TransientService));
        assert!(policy.is_retryable(FaultClassification::Network));
        assert!(policy.is_retryable(FaultClassification::Timeout));
    }

    #[test]
    fn test_presets_keep_default_whitelist() {
        for policy in [RetryPolicy::patient(), RetryPolicy::tight()] {
            assert!(!policy.is_retryable(FaultClassification::Validation));
            assert!(!policy.is_retryable(FaultClassification::Unclassified));
        }
    }

    #[test]
    fn test_registry_falls_back_per_target() {
        let registry = PolicyRegistry::new(RetryPolicy::default());
        registry.set("crm", RetryPolicy::tight());

        assert_eq!(registry.policy_for("crm").max_attempts, 2);
        assert_eq!(registry.policy_for("unknown").max_attempts, 3);

        registry.remove("crm");
        assert_eq!(registry.policy_for("crm").max_attempts, 3);
    }
}
