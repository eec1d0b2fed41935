//! Immutable, UUID-identified bundles of run events and their on-disk
//! store. A snapshot is written once, after a batch, and never edited.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CorelockError, Result};
use crate::executor::RunResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub uuid: Uuid,
    /// Seconds since the Unix epoch at creation time.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    pub events: Vec<RunResult>,
}

impl Snapshot {
    pub fn new(events: Vec<RunResult>, meta: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            timestamp: Utc::now().timestamp_micros() as f64 / 1e6,
            meta,
            events,
        }
    }
}

/// Directory of snapshot JSON documents keyed by UUID.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.snapshot_path(&snapshot.uuid);
        let tmp = self.dir.join(format!(".{}.tmp", snapshot.uuid));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(uuid = %snapshot.uuid, events = snapshot.events.len(), path = %path.display(), "Snapshot saved");
        Ok(path)
    }

    pub async fn load(&self, uuid: &Uuid) -> Result<Snapshot> {
        let path = self.snapshot_path(uuid);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CorelockError::SnapshotNotFound(*uuid));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// UUIDs of every stored snapshot, unordered.
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let mut uuids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(uuids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_string_lossy().strip_suffix(".json").map(String::from)
            else {
                continue;
            };
            if let Ok(uuid) = stem.parse() {
                uuids.push(uuid);
            }
        }
        Ok(uuids)
    }

    fn snapshot_path(&self, uuid: &Uuid) -> PathBuf {
        self.dir.join(format!("{uuid}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Classification, Problem, ProverSpec, RawOutput};

    fn test_event() -> RunResult {
        RunResult {
            program: ProverSpec {
                name: "z3".into(),
                binary: None,
                cmd: "z3 $file".into(),
                sat: "^sat".into(),
                unsat: "^unsat".into(),
                unknown: None,
                timeout: None,
                memory: None,
            },
            problem: Problem {
                path: "problems/p01.smt2".into(),
                expected: Classification::Unsat,
            },
            res: Classification::Unsat,
            raw: RawOutput {
                stdout: "unsat\n".into(),
                stderr: String::new(),
                errcode: 0,
                rtime: 0.12,
                utime: 0.1,
                stime: 0.01,
            },
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let snapshot = Snapshot::new(vec![test_event()], Some("nightly".into()));
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: Snapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[tokio::test]
    async fn test_store_save_load_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let snapshot = Snapshot::new(vec![test_event()], None);
        store.save(&snapshot).await.unwrap();

        let loaded = store.load(&snapshot.uuid).await.unwrap();
        assert_eq!(loaded, snapshot);

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![snapshot.uuid]);

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.load(&missing).await,
            Err(CorelockError::SnapshotNotFound(_))
        ));
    }
}
