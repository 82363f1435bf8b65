// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Whole-file JSON persistence shared by mirrors, cursors and the inbox.
//!
//! Writes go to a sibling `.partial` file that is renamed over the target,
//! so a crash mid-write leaves the previous version intact. There is no file
//! locking: each file has a single writer.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::traits::SyncError;

/// Read and decode a JSON file. `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SyncError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SyncError::io(path, e)),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| SyncError::Parse(format!("{}: {}", path.display(), e)))
}

/// Pretty-print `value` to `path` via write-then-rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
        }
    }
    let body = serde_json::to_vec_pretty(value)?;
    let partial = partial_path(path);
    tokio::fs::write(&partial, &body).await.map_err(|e| SyncError::io(&partial, e))?;
    tokio::fs::rename(&partial, path).await.map_err(|e| SyncError::io(path, e))?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_missing_and_empty_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(read_json::<Value>(&path).await.unwrap().is_none());
        std::fs::write(&path, "  \n").unwrap();
        assert!(read_json::<Value>(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_creates_parent_and_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &json!({"lastSyncId": 3})).await.unwrap();
        let back: Value = read_json(&path).await.unwrap().unwrap();
        assert_eq!(back["lastSyncId"], 3);
        assert!(!partial_path(&path).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[{").unwrap();
        assert!(matches!(read_json::<Value>(&path).await, Err(SyncError::Parse(_))));
    }
}
