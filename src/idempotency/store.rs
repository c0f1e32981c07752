use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{EnactorError, Result};

use super::cache::IdempotencyRecord;

/// Cross-restart persistence hook for hot cache records. Optional; the
/// cache runs fully in memory without one.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn save(&self, record: &IdempotencyRecord) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<IdempotencyRecord>>;
}

/// Append-only JSONL store. Re-saving a key appends a new line; load
/// keeps the newest line per key and drops expired records.
pub struct JsonlCacheStore {
    path: PathBuf,
}

impl JsonlCacheStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self::new(dir.join("idempotency").join("hot_records.jsonl"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonlCacheStore {
    async fn save(&self, record: &IdempotencyRecord) -> Result<()> {
        self.ensure_dir().await?;

        let line = serde_json::to_string(record)
            .map_err(|e| EnactorError::Persistence(format!("JSON serialize failed: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;

        debug!(key = %record.key, path = %self.path.display(), "Persisted hot cache record");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<IdempotencyRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let now = Utc::now();

        let mut by_key: HashMap<String, IdempotencyRecord> = HashMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<IdempotencyRecord>(line) {
                Ok(record) if !record.is_expired(now) => {
                    by_key.insert(record.key.clone(), record);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(line = %line, error = %e, "Skipping invalid cache record line");
                }
            }
        }

        let records: Vec<IdempotencyRecord> = by_key.into_values().collect();
        debug!(count = records.len(), path = %self.path.display(), "Loaded hot cache records");
        Ok(records)
    }
}
