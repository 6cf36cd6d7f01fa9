//! Snapshot persistence: load and save the in-memory store as one JSON file.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use strand_graph::MemoryStorage;

use crate::error::{CliError, Result};

/// Open the snapshot at `path`. A missing file is an empty store.
pub fn load_storage(path: &Path) -> Result<MemoryStorage> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(MemoryStorage::new());
        }
        Err(e) => return Err(e.into()),
    };

    let entries: BTreeMap<String, Value> =
        serde_json::from_str(&raw).map_err(|e| CliError::Snapshot {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    tracing::debug!(path = %path.display(), keys = entries.len(), "Snapshot loaded");
    Ok(MemoryStorage::from_snapshot(entries))
}

/// Write every entry of `storage` to `path`.
///
/// The file is replaced by rename, so a crash mid-write leaves the previous
/// snapshot intact.
pub async fn save_storage(path: &Path, storage: &MemoryStorage) -> Result<()> {
    let entries = storage.snapshot().await;
    let body = serde_json::to_string_pretty(&entries)?;

    let staging = path.with_extension("tmp");
    std::fs::write(&staging, body)?;
    std::fs::rename(&staging, path)?;

    tracing::info!(path = %path.display(), keys = entries.len(), "Snapshot saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_graph::Storage;

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = load_storage(&dir.path().join("absent.json")).unwrap();
        assert!(storage.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let storage = MemoryStorage::new();
        storage.put("u1", json!({ "name": "Ann" })).await.unwrap();
        storage.put("$nodeUids", json!({ "User": ["u1"] })).await.unwrap();
        save_storage(&path, &storage).await.unwrap();

        let reopened = load_storage(&path).unwrap();
        assert_eq!(reopened.snapshot().await, storage.snapshot().await);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let err = load_storage(&path).err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.starts_with("Corrupt snapshot")));
    }
}
