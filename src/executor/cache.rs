use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::Result;
use crate::executor::prover::RunResult;

/// Results older than this are recomputed.
const DEFAULT_TTL_SECS: i64 = 2 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    stored_at: DateTime<Utc>,
    result: RunResult,
}

/// Fingerprint-keyed result cache: one JSON file per entry, atomic writes,
/// and a per-key lock so concurrent misses coalesce into one producer.
///
/// Cache failures are never fatal; they log and fall through to live
/// execution.
pub struct ResultCache {
    dir: PathBuf,
    ttl_secs: i64,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl_secs: DEFAULT_TTL_SECS,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Serialise producers of the same fingerprint. The second caller
    /// blocks here, then finds the first caller's result on disk.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Fresh cached result for this fingerprint, if any.
    pub async fn lookup(&self, key: &str) -> Option<RunResult> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => {
                let age = (Utc::now() - entry.stored_at).num_seconds();
                if age <= self.ttl_secs {
                    Some(entry.result)
                } else {
                    None
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    /// Persist a result. Write failures are logged and swallowed.
    pub async fn store(&self, key: &str, result: &RunResult) {
        if let Err(e) = self.try_store(key, result).await {
            tracing::warn!(key, error = %e, "Cache write failed");
        }
    }

    async fn try_store(&self, key: &str, result: &RunResult) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let entry = CacheEntry {
            stored_at: Utc::now(),
            result: result.clone(),
        };
        // Temp file in the same directory so the rename is atomic.
        let tmp = self.dir.join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entry)?).await?;
        tokio::fs::rename(&tmp, self.entry_path(key)).await?;
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}
