//! Per-target execution statistics, process-lifetime only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::classify::FaultClassification;

/// Running counters for one target. Snapshots are plain clones; nothing
/// here blocks a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limit_hits: u64,
    pub auth_refreshes: u64,
    /// Keyed by classification name, e.g. "transient_service".
    pub classification_counts: HashMap<String, u64>,
    /// Running mean over every attempt, successful or not.
    pub avg_latency_ms: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl TargetStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    fn observe_latency(&mut self, latency_ms: f64) {
        self.attempts += 1;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.attempts as f64;
        self.last_attempt_at = Some(Utc::now());
    }

    fn merge(&mut self, other: &TargetStats) {
        let combined = self.attempts + other.attempts;
        if combined > 0 {
            self.avg_latency_ms = (self.avg_latency_ms * self.attempts as f64
                + other.avg_latency_ms * other.attempts as f64)
                / combined as f64;
        }
        self.attempts = combined;
        self.successes += other.successes;
        self.failures += other.failures;
        self.rate_limit_hits += other.rate_limit_hits;
        self.auth_refreshes += other.auth_refreshes;
        for (classification, count) in &other.classification_counts {
            *self
                .classification_counts
                .entry(classification.clone())
                .or_insert(0) += count;
        }
        self.last_attempt_at = match (self.last_attempt_at, other.last_attempt_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Concurrent per-target stats map. Explicitly constructed and injectable
/// so tests get isolated instances; `reset` clears everything.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    targets: DashMap<String, TargetStats>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, target: &str, latency_ms: f64) {
        let mut stats = self.targets.entry(target.to_string()).or_default();
        stats.observe_latency(latency_ms);
        stats.successes += 1;
    }

    pub fn record_failure(
        &self,
        target: &str,
        latency_ms: f64,
        classification: FaultClassification,
    ) {
        let mut stats = self.targets.entry(target.to_string()).or_default();
        stats.observe_latency(latency_ms);
        stats.failures += 1;
        if classification == FaultClassification::RateLimited {
            stats.rate_limit_hits += 1;
        }
        *stats
            .classification_counts
            .entry(classification.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_auth_refresh(&self, target: &str) {
        self.targets
            .entry(target.to_string())
            .or_default()
            .auth_refreshes += 1;
    }

    pub fn snapshot(&self, target: &str) -> Option<TargetStats> {
        self.targets.get(target).map(|stats| stats.clone())
    }

    pub fn snapshot_all(&self) -> HashMap<String, TargetStats> {
        self.targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Aggregate across every target.
    pub fn totals(&self) -> TargetStats {
        let mut totals = TargetStats::default();
        for entry in self.targets.iter() {
            totals.merge(entry.value());
        }
        totals
    }

    pub fn reset(&self) {
        self.targets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_running_average() {
        let registry = StatsRegistry::new();
        registry.record_success("crm", 100.0);
        registry.record_failure("crm", 300.0, FaultClassification::RateLimited);
        registry.record_failure("crm", 200.0, FaultClassification::TransientService);

        let stats = registry.snapshot("crm").unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.rate_limit_hits, 1);
        assert_eq!(stats.classification_counts.get("rate_limited"), Some(&1));
        assert_eq!(
            stats.classification_counts.get("transient_service"),
            Some(&1)
        );
        assert!((stats.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!((stats.success_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_totals_merge_targets() {
        let registry = StatsRegistry::new();
        registry.record_success("a", 100.0);
        registry.record_success("b", 300.0);
        registry.record_auth_refresh("b");

        let totals = registry.totals();
        assert_eq!(totals.attempts, 2);
        assert_eq!(totals.successes, 2);
        assert_eq!(totals.auth_refreshes, 1);
        assert!((totals.avg_latency_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = StatsRegistry::new();
        registry.record_success("a", 10.0);
        registry.reset();
        assert!(registry.snapshot("a").is_none());
        assert_eq!(registry.totals().attempts, 0);
    }

    #[test]
    fn test_unknown_target_snapshot_is_none() {
        assert!(StatsRegistry::new().snapshot("ghost").is_none());
    }
}
