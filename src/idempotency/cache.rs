use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action::ActionDescriptor;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::events::{EventBus, EventPayload};

use super::key::derive_key;
use super::store::CacheStore;

/// One cached execution result keyed by the derived action hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub correlation_id: String,
    pub action_type: String,
    pub target: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub hit_count: u64,
    pub hot: bool,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Suppresses duplicate execution of logically-identical actions.
///
/// Purely in-memory; a `CacheStore` can be attached to carry hot records
/// across restarts. Expired records are dropped lazily on lookup and by
/// the periodic sweeper.
pub struct IdempotencyCache {
    config: CacheConfig,
    records: DashMap<String, IdempotencyRecord>,
    store: Option<Arc<dyn CacheStore>>,
    events: EventBus,
}

impl IdempotencyCache {
    pub fn new(config: CacheConfig, events: EventBus) -> Self {
        Self {
            config,
            records: DashMap::new(),
            store: None,
            events,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Drop every record. Attached store contents are left untouched.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Load persisted hot records from the attached store. Returns the
    /// number restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut restored = 0;
        for record in store.load_all().await? {
            if record.is_expired(now) {
                continue;
            }
            self.records.insert(record.key.clone(), record);
            restored += 1;
        }
        if restored > 0 {
            debug!(restored, "Restored hot cache records");
        }
        Ok(restored)
    }

    /// O(1) lookup. A hit bumps the hit count and access time; crossing
    /// the hot threshold persists the record through the attached store.
    /// Expired records are removed and reported as a miss.
    pub async fn lookup(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let (result, hit_count, newly_hot) = {
            let mut entry = self.records.get_mut(key)?;
            if entry.is_expired(now) {
                drop(entry);
                self.records.remove(key);
                return None;
            }
            entry.hit_count += 1;
            entry.last_accessed_at = now;
            let newly_hot =
                !entry.hot && entry.hit_count >= u64::from(self.config.hot_threshold);
            if newly_hot {
                entry.hot = true;
            }
            (
                entry.result.clone(),
                entry.hit_count,
                newly_hot.then(|| entry.value().clone()),
            )
        };

        if let Some(record) = newly_hot {
            if let Some(store) = &self.store {
                if let Err(error) = store.save(&record).await {
                    warn!(key = %key, error = %error, "Failed to persist hot cache record");
                }
            }
        }

        self.events.publish(EventPayload::CacheHit {
            key: key.to_string(),
            hit_count,
        });
        Some(result)
    }

    /// Cache a successful result under the action's derived key, using the
    /// type-dependent TTL from configuration. Returns the key.
    pub fn record(&self, action: &ActionDescriptor, result: Value) -> String {
        let ttl = self.config.ttl_for(&action.action_type);
        self.record_with_ttl(action, result, ttl)
    }

    pub fn record_with_ttl(
        &self,
        action: &ActionDescriptor,
        result: Value,
        ttl: Duration,
    ) -> String {
        let key = derive_key(action);
        if !self.records.contains_key(&key) && self.records.len() >= self.config.capacity {
            self.evict_lru();
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = now + ttl;
        let record = IdempotencyRecord {
            key: key.clone(),
            correlation_id: action.correlation_id.clone(),
            action_type: action.action_type.clone(),
            target: action.target.clone(),
            result,
            created_at: now,
            expires_at,
            last_accessed_at: now,
            hit_count: 0,
            hot: false,
        };
        self.records.insert(key.clone(), record);

        self.events.publish(EventPayload::CacheStored {
            key: key.clone(),
            action_type: action.action_type.clone(),
            expires_at,
        });
        key
    }

    /// Remove one record by key. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.records.remove(key).is_some();
        if removed {
            self.events
                .publish(EventPayload::CacheInvalidated { removed: 1 });
        }
        removed
    }

    /// Bulk removal of every record matching the predicate. Used when a
    /// source's behavior is known to have changed and its cached results
    /// can no longer be trusted.
    pub fn invalidate_by_predicate(
        &self,
        predicate: impl Fn(&IdempotencyRecord) -> bool,
    ) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !predicate(record));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            self.events
                .publish(EventPayload::CacheInvalidated { removed });
        }
        removed
    }

    /// Run `executor` at most once for this action: a fresh hit returns
    /// the cached result without invoking it, a miss runs it and caches
    /// the success. Failures propagate uncached.
    pub async fn wrap<F, Fut>(&self, action: &ActionDescriptor, executor: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let key = derive_key(action);
        if let Some(cached) = self.lookup(&key).await {
            debug!(
                key = %key,
                action_type = %action.action_type,
                "Duplicate action suppressed by cache"
            );
            return Ok(cached);
        }

        let result = executor().await?;
        self.record(action, result.clone());
        Ok(result)
    }

    /// Drop every expired record. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            self.events.publish(EventPayload::CacheEvicted { evicted });
        }
        evicted
    }

    /// Background sweeper on the configured interval. Exits when the
    /// shutdown signal fires or its sender is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = Duration::from_secs(cache.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache records");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn evict_lru(&self) {
        let batch = (self.config.capacity / 5).max(1);
        let mut candidates: Vec<(String, DateTime<Utc>)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_accessed_at))
            .collect();
        candidates.sort_by_key(|(_, accessed)| *accessed);

        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(batch) {
            if self.records.remove(&key).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "Evicted least-recently-used cache records");
            self.events.publish(EventPayload::CacheEvicted { evicted });
        }
    }
}
