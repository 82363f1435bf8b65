// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change ledger records.
//!
//! A [`ChangeRecord`] is one row of the outbox table. Rows are immutable once
//! written: consumers read them in `id` order and never update them.
//!
//! # Example
//!
//! ```
//! use mirror_sync::{ChangeRecord, ChangeType};
//! use serde_json::json;
//!
//! let record = ChangeRecord {
//!     id: 1,
//!     sync_time: "2025-01-01T10:00:00.000Z".into(),
//!     change_type: ChangeType::Create,
//!     change_data: json!({"table": "Products", "id": "p1"}),
//! };
//!
//! let target = record.target().unwrap();
//! assert_eq!(target.table, "Products");
//! assert_eq!(target.id, "p1");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::traits::SyncError;

/// Kind of change carried by a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    PasswordReset,
    UserLogin,
    BillCreated,
    /// Written by a newer producer; ignored by this consumer.
    Other(String),
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::PasswordReset => "password_reset",
            ChangeType::UserLogin => "USER_LOGIN",
            ChangeType::BillCreated => "BILL_CREATED",
            ChangeType::Other(s) => s,
        }
    }

    /// Whether the row asks the mirror to be refreshed from the store.
    #[must_use]
    pub fn refreshes_mirror(&self) -> bool {
        matches!(
            self,
            ChangeType::Create | ChangeType::Update | ChangeType::UserLogin | ChangeType::BillCreated
        )
    }
}

impl From<&str> for ChangeType {
    fn from(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "create" => ChangeType::Create,
            "update" => ChangeType::Update,
            "delete" => ChangeType::Delete,
            "password_reset" => ChangeType::PasswordReset,
            "user_login" => ChangeType::UserLogin,
            "bill_created" => ChangeType::BillCreated,
            _ => ChangeType::Other(trimmed.to_string()),
        }
    }
}

impl From<String> for ChangeType {
    fn from(s: String) -> Self {
        ChangeType::from(s.as_str())
    }
}

impl From<ChangeType> for String {
    fn from(t: ChangeType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    /// RFC 3339, UTC
    pub sync_time: String,
    pub change_type: ChangeType,
    pub change_data: Value,
}

/// `{table, id}` addressed by a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTarget {
    pub table: String,
    pub id: String,
}

/// User snapshot carried by a `password_reset` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetUser {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl ChangeRecord {
    /// The table and row id this change refers to.
    pub fn target(&self) -> Result<ChangeTarget, SyncError> {
        let table = self.change_data.get("table").and_then(Value::as_str).filter(|t| !t.is_empty());
        let id = self.change_data.get("id").and_then(id_string);
        match (table, id) {
            (Some(table), Some(id)) => Ok(ChangeTarget { table: table.to_string(), id }),
            _ => Err(SyncError::Parse(format!(
                "ledger row {} has no {{table, id}} in change_data",
                self.id
            ))),
        }
    }

    /// The user whose password changed.
    pub fn reset_user(&self) -> Result<ResetUser, SyncError> {
        let id = self.change_data.get("id").and_then(id_string);
        let name = self.change_data.get("name").and_then(Value::as_str).filter(|n| !n.is_empty());
        match (id, name) {
            (Some(id), Some(name)) => Ok(ResetUser {
                id,
                name: name.to_string(),
                email: self
                    .change_data
                    .get("email")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => Err(SyncError::Parse(format!(
                "ledger row {} is missing user id or name",
                self.id
            ))),
        }
    }
}

/// Decode `change_data` as stored. Producers sometimes store an
/// already-serialized JSON string in the JSON column; unwrap one level.
pub fn decode_change_data(raw: &str) -> Result<Value, SyncError> {
    let value: Value = serde_json::from_str(raw)?;
    if let Value::String(inner) = &value {
        if let Ok(nested) = serde_json::from_str::<Value>(inner) {
            if nested.is_object() {
                return Ok(nested);
            }
        }
    }
    Ok(value)
}

/// String form of a record id (ids may be JSON strings or numbers).
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
