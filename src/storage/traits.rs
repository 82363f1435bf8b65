// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::change::{ChangeRecord, ChangeType};
use crate::entity::EntityDef;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Lost or unreachable database; safe to retry.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unparsable input: {0}")]
    Parse(String),
    #[error("missing reference: {table} '{id}' does not exist")]
    Referential { table: String, id: String },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SyncError::Io { path: path.as_ref().to_path_buf(), source }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SyncError::Connection(err.to_string()),
            // SQLSTATE class 08: connection exception (MySQL 2006/2013 report 08S01)
            sqlx::Error::Database(db)
                if db.code().map(|c| c.starts_with("08")).unwrap_or(false) =>
            {
                SyncError::Connection(err.to_string())
            }
            _ => SyncError::Database(err.to_string()),
        }
    }
}

/// Read side of the change ledger plus appends from replay.
#[async_trait]
pub trait ChangeLedger: Send + Sync {
    /// Rows with `id > cursor`, ascending, at most `limit`.
    async fn fetch_after(&self, cursor: i64, limit: usize) -> Result<Vec<ChangeRecord>, SyncError>;

    /// Append a row and return its store-assigned id.
    async fn append(&self, change_type: &ChangeType, change_data: &Value) -> Result<i64, SyncError>;
}

/// Source of canonical entity rows for the mirrors.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Canonical row as a JSON object, with the entity's side collection
    /// attached. `None` when the row no longer exists.
    async fn fetch_record(&self, entity: &EntityDef, id: &str) -> Result<Option<Value>, SyncError>;

    /// Trivial round trip used as keep-alive and reachability probe.
    async fn ping(&self) -> Result<(), SyncError>;
}

/// Transactional target for replayed audit-log changes.
///
/// Each call runs in its own transaction which also appends the matching
/// ledger row; on error nothing is committed.
#[async_trait]
pub trait ReplaySink: Send + Sync {
    /// Delete the row (and its side/child rows). Returns the ledger row id.
    async fn replay_delete(&self, entity: &EntityDef, id: &str) -> Result<i64, SyncError>;

    /// Upsert the mirror record. Returns the ledger row id, or
    /// [`SyncError::Referential`] when a required reference is missing.
    async fn replay_upsert(&self, entity: &EntityDef, id: &str, record: &Value) -> Result<i64, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(SyncError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(SyncError::from(sqlx::Error::PoolClosed).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(SyncError::from(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn test_row_errors_are_not_transient() {
        assert!(!SyncError::from(sqlx::Error::RowNotFound).is_transient());
        assert!(!SyncError::Parse("x".into()).is_transient());
        assert!(!SyncError::Referential { table: "Users".into(), id: "u1".into() }.is_transient());
    }

    #[test]
    fn test_io_error_names_path() {
        let err = SyncError::io("/tmp/products.json", std::io::Error::other("disk full"));
        assert!(err.to_string().contains("/tmp/products.json"));
    }
}
