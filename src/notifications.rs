// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Notification inbox backed by `notifications.json`.
//!
//! Newest first, capped (100 by default). Forward sync creates at most one
//! notification per ledger row; `syncLogId` is the dedupe key. Ledger ids
//! only grow, so any id at or below the newest one in the inbox has been
//! seen already, even when truncation dropped its notification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::change::ResetUser;
use crate::storage::json_file::{read_json, write_json_atomic};
use crate::storage::sql::{parse_instant, render_timestamp};
use crate::storage::traits::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    PasswordReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub is_read: bool,
    pub created_at: String,
    pub sync_log_id: i64,
}

impl Notification {
    pub fn password_reset(user: &ResetUser, sync_log_id: i64, sync_time: &str) -> Self {
        Self {
            id: format!("notif_{}_{}_{}", Utc::now().timestamp_millis(), sync_log_id, user.id),
            kind: NotificationKind::PasswordReset,
            title: "Password Changed".to_string(),
            message: format!("The user {} has changed the password", user.name),
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            user_email: user.email.clone(),
            is_read: false,
            created_at: render_timestamp(sync_time).unwrap_or_else(|| sync_time.to_string()),
            sync_log_id,
        }
    }
}

pub struct NotificationStore {
    path: PathBuf,
    cap: usize,
}

impl NotificationStore {
    pub fn new(path: impl Into<PathBuf>, cap: usize) -> Self {
        Self { path: path.into(), cap: cap.max(1) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty inbox if none exists yet.
    pub async fn ensure_exists(&self) -> Result<(), SyncError> {
        if tokio::fs::try_exists(&self.path).await.map_err(|e| SyncError::io(&self.path, e))? {
            return Ok(());
        }
        write_json_atomic(&self.path, &Vec::<Notification>::new()).await
    }

    /// All notifications, newest first.
    pub async fn list(&self) -> Result<Vec<Notification>, SyncError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn unread_count(&self) -> Result<usize, SyncError> {
        Ok(self.list().await?.iter().filter(|n| !n.is_read).count())
    }

    /// Add a password-reset notice unless one already exists for this
    /// ledger row. Returns whether a notification was created.
    pub async fn record_password_reset(
        &self,
        user: &ResetUser,
        sync_log_id: i64,
        sync_time: &str,
    ) -> Result<bool, SyncError> {
        let mut all = self.list().await?;
        if all.iter().any(|n| n.sync_log_id >= sync_log_id) {
            debug!(sync_log_id, "Ledger row already notified");
            return Ok(false);
        }

        let notification = Notification::password_reset(user, sync_log_id, sync_time);
        info!(user = %user.name, sync_log_id, "Created notification: {}", notification.message);
        all.insert(0, notification);
        all.truncate(self.cap);
        write_json_atomic(&self.path, &all).await?;
        Ok(true)
    }

    /// Mark one notification read. Returns false if the id is unknown.
    pub async fn mark_read(&self, id: &str) -> Result<bool, SyncError> {
        let mut all = self.list().await?;
        let Some(notification) = all.iter_mut().find(|n| n.id == id) else {
            return Ok(false);
        };
        if !notification.is_read {
            notification.is_read = true;
            write_json_atomic(&self.path, &all).await?;
        }
        Ok(true)
    }

    /// Mark everything read. Returns how many changed.
    pub async fn mark_all_read(&self) -> Result<usize, SyncError> {
        let mut all = self.list().await?;
        let mut changed = 0;
        for notification in all.iter_mut().filter(|n| !n.is_read) {
            notification.is_read = true;
            changed += 1;
        }
        if changed > 0 {
            write_json_atomic(&self.path, &all).await?;
        }
        Ok(changed)
    }

    /// Delete one notification. Returns false if the id is unknown.
    pub async fn remove(&self, id: &str) -> Result<bool, SyncError> {
        let mut all = self.list().await?;
        let before = all.len();
        all.retain(|n| n.id != id);
        if all.len() == before {
            return Ok(false);
        }
        write_json_atomic(&self.path, &all).await?;
        Ok(true)
    }

    /// Delete notifications created more than `age` ago, and those whose
    /// creation time cannot be read. Returns how many were removed.
    pub async fn remove_older_than(&self, age: Duration) -> Result<usize, SyncError> {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut all = self.list().await?;
        let before = all.len();
        all.retain(|n| match (parse_instant(&n.created_at), cutoff) {
            (Some(created), Some(cutoff)) => created > cutoff,
            (Some(_), None) => true,
            (None, _) => false,
        });
        let removed = before - all.len();
        if removed > 0 {
            write_json_atomic(&self.path, &all).await?;
            info!(removed, "Removed old notifications");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ResetUser {
        ResetUser { id: "u1".into(), name: "Alice".into(), email: "alice@example.com".into() }
    }

    #[tokio::test]
    async fn test_dedupe_by_sync_log_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = NotificationStore::new(dir.path().join("notifications.json"), 100);
        store.ensure_exists().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());

        assert!(store.record_password_reset(&alice(), 9, "2025-01-01 10:00:00").await.unwrap());
        assert!(!store.record_password_reset(&alice(), 9, "2025-01-01 10:00:00").await.unwrap());

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message, "The user Alice has changed the password");
        assert_eq!(all[0].created_at, "2025-01-01T10:00:00.000Z");
        assert!(all[0].id.starts_with("notif_") && all[0].id.ends_with("_u1"));
    }

    #[tokio::test]
    async fn test_wire_format_is_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = NotificationStore::new(dir.path().join("notifications.json"), 100);
        store.record_password_reset(&alice(), 3, "t").await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        let first = &raw[0];
        assert_eq!(first["type"], "PASSWORD_RESET");
        assert_eq!(first["title"], "Password Changed");
        assert_eq!(first["userId"], "u1");
        assert_eq!(first["userEmail"], "alice@example.com");
        assert_eq!(first["isRead"], false);
        assert_eq!(first["syncLogId"], 3);
    }

    #[tokio::test]
    async fn test_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = NotificationStore::new(dir.path().join("notifications.json"), 3);
        for id in 1..=5 {
            store.record_password_reset(&alice(), id, "t").await.unwrap();
        }
        let ids: Vec<i64> = store.list().await.unwrap().iter().map(|n| n.sync_log_id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_mark_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = NotificationStore::new(dir.path().join("notifications.json"), 100);
        store.record_password_reset(&alice(), 1, "t").await.unwrap();
        store.record_password_reset(&alice(), 2, "t").await.unwrap();
        assert_eq!(store.unread_count().await.unwrap(), 2);

        let first = store.list().await.unwrap()[0].id.clone();
        assert!(store.mark_read(&first).await.unwrap());
        assert!(!store.mark_read("notif_missing").await.unwrap());
        assert_eq!(store.unread_count().await.unwrap(), 1);

        assert_eq!(store.mark_all_read().await.unwrap(), 1);
        assert_eq!(store.unread_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncated_rows_are_not_notified_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = NotificationStore::new(dir.path().join("notifications.json"), 3);
        for id in 1..=5 {
            store.record_password_reset(&alice(), id, "t").await.unwrap();
        }
        store.mark_all_read().await.unwrap();

        // redelivery of the whole ledger, including rows the cap dropped
        for id in 1..=5 {
            assert!(!store.record_password_reset(&alice(), id, "t").await.unwrap());
        }
        assert_eq!(store.unread_count().await.unwrap(), 0);
        assert!(store.record_password_reset(&alice(), 6, "t").await.unwrap());
        let ids: Vec<i64> = store.list().await.unwrap().iter().map(|n| n.sync_log_id).collect();
        assert_eq!(ids, vec![6, 5, 4]);
    }

    #[tokio::test]
    async fn test_remove_and_remove_older_than() {
        let dir = tempfile::tempdir().unwrap();
        let store = NotificationStore::new(dir.path().join("notifications.json"), 100);
        let recent = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        store.record_password_reset(&alice(), 1, "2020-01-01 10:00:00").await.unwrap();
        store.record_password_reset(&alice(), 2, "not a time").await.unwrap();
        store.record_password_reset(&alice(), 3, &recent).await.unwrap();
        store.record_password_reset(&alice(), 4, &recent).await.unwrap();

        let newest = store.list().await.unwrap()[0].id.clone();
        assert!(store.remove(&newest).await.unwrap());
        assert!(!store.remove(&newest).await.unwrap());

        assert_eq!(store.remove_older_than(Duration::from_secs(30 * 86_400)).await.unwrap(), 2);
        let left: Vec<i64> = store.list().await.unwrap().iter().map(|n| n.sync_log_id).collect();
        assert_eq!(left, vec![3]);
        assert_eq!(store.remove_older_than(Duration::from_secs(30 * 86_400)).await.unwrap(), 0);
    }
}
