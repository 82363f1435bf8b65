// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted progress for both sync directions.
//!
//! - `sync_state.json`: `{"lastSyncId": n}`, the highest ledger id applied
//!   to the mirrors. Saves never move it backwards.
//! - `processing_state.json`: `{"products.json.log": n, ...}`, non-empty
//!   lines of each audit log already replayed into the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::json_file::{read_json, write_json_atomic};
use crate::storage::traits::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default)]
    pub last_sync_id: i64,
}

/// Ledger cursor for forward sync.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current cursor; 0 when nothing was applied yet.
    ///
    /// A corrupt state file restarts from 0: replay is idempotent, so
    /// reprocessing the ledger is safe where skipping it is not.
    pub async fn load(&self) -> Result<i64, SyncError> {
        match read_json::<SyncState>(&self.path).await {
            Ok(state) => Ok(state.unwrap_or_default().last_sync_id),
            Err(SyncError::Parse(msg)) => {
                warn!(path = %self.path.display(), error = %msg, "Corrupt sync state, restarting from 0");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist `last_sync_id` if it moves the cursor forward.
    /// Returns whether anything was written.
    pub async fn advance(&self, last_sync_id: i64) -> Result<bool, SyncError> {
        let current = self.load().await?;
        if last_sync_id <= current {
            debug!(current, requested = last_sync_id, "Cursor not advanced");
            return Ok(false);
        }
        write_json_atomic(&self.path, &SyncState { last_sync_id }).await?;
        Ok(true)
    }
}

/// Per-file cursors for reverse sync.
pub struct ProcessingStateStore {
    path: PathBuf,
}

impl ProcessingStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BTreeMap<String, usize>, SyncError> {
        match read_json::<BTreeMap<String, usize>>(&self.path).await {
            Ok(state) => Ok(state.unwrap_or_default()),
            Err(SyncError::Parse(msg)) => {
                warn!(path = %self.path.display(), error = %msg, "Corrupt processing state, starting over");
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, file_name: &str) -> Result<usize, SyncError> {
        Ok(self.load().await?.get(file_name).copied().unwrap_or(0))
    }

    /// Record the cursor for one file, leaving the others untouched.
    pub async fn set(&self, file_name: &str, processed: usize) -> Result<(), SyncError> {
        let mut state = self.load().await?;
        if state.get(file_name) == Some(&processed) {
            return Ok(());
        }
        state.insert(file_name.to_string(), processed);
        write_json_atomic(&self.path, &state).await
    }
}
