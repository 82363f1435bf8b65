// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Forward sync: change ledger → JSON mirrors and notifications.
//!
//! ```text
//!   sync_table (id > cursor, ascending, paged)
//!        │
//!        ├─ password_reset ──────────────► notifications.json (dedupe on syncLogId)
//!        ├─ delete ──────────────────────► <entity>.json (remove if present)
//!        └─ create/update/USER_LOGIN/... ─► fetch canonical row ─► <entity>.json (overlay)
//!        │
//!        └─ page done ─► sync_state.json {"lastSyncId": max(id)}
//! ```
//!
//! Delivery is at-least-once: a crash mid-page replays the page, and every
//! step above is idempotent. Row-level problems (bad `change_data`, rows
//! deleted since, unknown tables) are logged and skipped. Connection loss
//! and mirror I/O failures abort the pass with the cursor left where it was.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, Notify};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::is_audit_log;
use crate::change::{ChangeRecord, ChangeType};
use crate::config::SyncConfig;
use crate::entity::EntityRegistry;
use crate::notifications::NotificationStore;
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::storage::mirror::MirrorStore;
use crate::storage::state::{CursorStore, ProcessingStateStore};
use crate::storage::traits::{ChangeLedger, RecordSource, SyncError};

/// What applying one ledger row did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// A mirror or the inbox was written
    Applied,
    /// Already reflected; nothing written
    Unchanged,
    /// Ignored (unknown change type, row gone from the store)
    Skipped,
}

impl RowOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Applied => "applied",
            RowOutcome::Unchanged => "unchanged",
            RowOutcome::Skipped => "skipped",
        }
    }
}

/// Summary of one forward pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub rows: usize,
    pub applied: usize,
    pub unchanged: usize,
    /// Skipped rows, including rejected ones
    pub skipped: usize,
    pub notifications: usize,
    /// Cursor after the pass
    pub cursor: i64,
}

/// Wakes the forward loop ahead of its timer. Pokes made while a pass is
/// running collapse into a single follow-up pass.
#[derive(Clone, Default)]
pub struct ForwardTrigger(Arc<Notify>);

impl ForwardTrigger {
    pub fn poke(&self) {
        self.0.notify_one();
    }

    async fn notified(&self) {
        self.0.notified().await;
    }
}

pub struct ForwardSync {
    ledger: Arc<dyn ChangeLedger>,
    source: Arc<dyn RecordSource>,
    mirrors: MirrorStore,
    cursor: CursorStore,
    processing: ProcessingStateStore,
    notifications: NotificationStore,
    entities: EntityRegistry,
    log_dir: PathBuf,
    batch_size: usize,
    retry: RetryConfig,
    poll_interval: Duration,
    keep_alive_interval: Duration,
    log_retention: Duration,
    trigger: ForwardTrigger,
}

impl ForwardSync {
    pub fn new(config: &SyncConfig, ledger: Arc<dyn ChangeLedger>, source: Arc<dyn RecordSource>) -> Self {
        Self {
            ledger,
            source,
            mirrors: MirrorStore::new(&config.json_dir),
            cursor: CursorStore::new(config.sync_state_path()),
            processing: ProcessingStateStore::new(config.processing_state_path()),
            notifications: NotificationStore::new(config.notifications_path(), config.notification_cap),
            entities: config.entities.clone(),
            log_dir: config.log_dir.clone(),
            batch_size: config.ledger_batch_size.max(1),
            retry: RetryConfig::fixed(config.retry_attempts, config.retry_delay()),
            poll_interval: config.forward_interval(),
            keep_alive_interval: config.keep_alive_interval(),
            log_retention: config.log_retention(),
            trigger: ForwardTrigger::default(),
        }
    }

    /// Handle for requesting an early pass.
    pub fn trigger(&self) -> ForwardTrigger {
        self.trigger.clone()
    }

    pub fn mirrors(&self) -> &MirrorStore {
        &self.mirrors
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    /// Create directories and an empty inbox.
    pub async fn prepare(&self) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(self.mirrors.dir())
            .await
            .map_err(|e| SyncError::io(self.mirrors.dir(), e))?;
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| SyncError::io(&self.log_dir, e))?;
        self.notifications.ensure_exists().await
    }

    /// Apply every ledger row past the cursor, page by page.
    #[tracing::instrument(skip(self))]
    pub async fn run_pass(&self) -> Result<ForwardReport, SyncError> {
        let _timer = crate::metrics::PassTimer::new("forward");
        let mut cursor = self.cursor.load().await?;
        let mut report = ForwardReport { cursor, ..Default::default() };

        loop {
            let page = retry_when(
                "fetch_ledger",
                &self.retry,
                || self.ledger.fetch_after(cursor, self.batch_size),
                SyncError::is_transient,
            )
            .await
            .inspect_err(|e| self.record_abort("fetch_ledger", e))?;

            let Some(last_id) = page.iter().map(|r| r.id).max() else {
                break;
            };

            for record in &page {
                report.rows += 1;
                match self.apply_change(record).await {
                    Ok(outcome) => {
                        crate::metrics::record_ledger_row(record.change_type.as_str(), outcome.as_str());
                        match outcome {
                            RowOutcome::Applied => {
                                report.applied += 1;
                                if record.change_type == ChangeType::PasswordReset {
                                    report.notifications += 1;
                                }
                            }
                            RowOutcome::Unchanged => report.unchanged += 1,
                            RowOutcome::Skipped => report.skipped += 1,
                        }
                    }
                    Err(e) if aborts_pass(&e) => {
                        self.record_abort("apply_change", &e);
                        error!(ledger_id = record.id, error = %e, "Forward pass aborted; cursor unchanged");
                        return Err(e);
                    }
                    Err(e) => {
                        crate::metrics::record_ledger_row(record.change_type.as_str(), "failed");
                        warn!(
                            ledger_id = record.id,
                            change_type = %record.change_type,
                            error = %e,
                            "Skipping ledger row"
                        );
                        report.skipped += 1;
                    }
                }
            }

            self.cursor.advance(last_id).await?;
            cursor = last_id;
            report.cursor = cursor;
            crate::metrics::set_forward_cursor(cursor);
            debug!(cursor, rows = page.len(), "Ledger page applied");

            if page.len() < self.batch_size {
                break;
            }
        }

        crate::metrics::record_pass("forward", "success");
        if report.rows > 0 {
            info!(
                rows = report.rows,
                applied = report.applied,
                skipped = report.skipped,
                cursor = report.cursor,
                "Forward pass complete"
            );
        }
        Ok(report)
    }

    /// Apply one ledger row to the mirrors or the inbox.
    pub async fn apply_change(&self, record: &ChangeRecord) -> Result<RowOutcome, SyncError> {
        match &record.change_type {
            ChangeType::PasswordReset => {
                let user = record.reset_user()?;
                let created = self
                    .notifications
                    .record_password_reset(&user, record.id, &record.sync_time)
                    .await?;
                if created {
                    crate::metrics::record_notification_created();
                    Ok(RowOutcome::Applied)
                } else {
                    Ok(RowOutcome::Unchanged)
                }
            }
            ChangeType::Delete => {
                let target = record.target()?;
                let entity = self.entities.for_table(&target.table)?;
                let change = self.mirrors.remove(&entity, &target.id).await?;
                Ok(self.mirror_outcome(&entity.name, change))
            }
            change_type if change_type.refreshes_mirror() => {
                let target = record.target()?;
                let entity = self.entities.for_table(&target.table)?;
                let fetched = retry_when(
                    "fetch_record",
                    &self.retry,
                    || self.source.fetch_record(&entity, &target.id),
                    SyncError::is_transient,
                )
                .await?;

                let Some(canonical) = fetched else {
                    debug!(table = %target.table, id = %target.id, "Row no longer exists, skipping");
                    return Ok(RowOutcome::Skipped);
                };
                let change = self.mirrors.upsert(&entity, canonical).await?;
                Ok(self.mirror_outcome(&entity.name, change))
            }
            other => {
                debug!(ledger_id = record.id, change_type = %other, "Ignoring change type");
                Ok(RowOutcome::Skipped)
            }
        }
    }

    fn mirror_outcome(&self, entity: &str, change: crate::storage::mirror::MirrorChange) -> RowOutcome {
        if change.wrote() {
            crate::metrics::record_mirror_write(entity, change.as_str());
            RowOutcome::Applied
        } else {
            RowOutcome::Unchanged
        }
    }

    fn record_abort(&self, operation: &str, err: &SyncError) {
        if err.is_transient() {
            crate::metrics::record_connection_error(operation);
        }
        crate::metrics::record_pass("forward", "failed");
    }

    /// Delete audit logs untouched for longer than the retention period.
    /// Reserved files and logs with lines not yet replayed are kept.
    pub async fn cleanup_logs(&self) -> Result<usize, SyncError> {
        let mut dir = match tokio::fs::read_dir(&self.log_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SyncError::io(&self.log_dir, e)),
        };
        let processing = self.processing.load().await?;
        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = dir.next_entry().await.map_err(|e| SyncError::io(&self.log_dir, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_audit_log(&name) {
                continue;
            }
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(file = %name, error = %e, "Cannot stat log file");
                    continue;
                }
            };
            if now.duration_since(modified).unwrap_or_default() < self.log_retention {
                continue;
            }

            if self.entities.for_log_file(&name).is_some() {
                let content = tokio::fs::read_to_string(&path).await.map_err(|e| SyncError::io(&path, e))?;
                let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
                let processed = processing.get(&name).copied().unwrap_or(0);
                if processed < lines {
                    warn!(file = %name, processed, lines, "Expired log still has unreplayed lines, keeping");
                    continue;
                }
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(file = %name, "Deleted expired log file");
                    removed += 1;
                }
                Err(e) => warn!(file = %name, error = %e, "Failed to delete expired log file"),
            }
        }

        crate::metrics::record_logs_cleaned(removed);
        Ok(removed)
    }

    /// Trivial query so idle connections are not reaped by the server.
    pub async fn keep_alive(&self) {
        match self.source.ping().await {
            Ok(()) => debug!("Keep-alive ok"),
            Err(e) => warn!(error = %e, "Keep-alive query failed"),
        }
    }

    async fn pass_and_cleanup(&self) {
        if let Err(e) = self.run_pass().await {
            error!(error = %e, "Forward pass failed");
        }
        if let Err(e) = self.cleanup_logs().await {
            warn!(error = %e, "Log cleanup failed");
        }
    }

    /// Poll until `shutdown` flips to true. The first pass runs immediately.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.prepare().await {
            error!(error = %e, "Failed to prepare mirror directories");
        }
        info!(interval_secs = self.poll_interval.as_secs(), "Forward sync running");

        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive = interval_at(Instant::now() + self.keep_alive_interval, self.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => self.pass_and_cleanup().await,
                _ = self.trigger.notified() => {
                    debug!("Forward pass triggered");
                    self.pass_and_cleanup().await;
                }
                _ = keep_alive.tick() => self.keep_alive().await,
            }
        }
        info!("Forward sync stopped");
    }
}

/// Errors that stop the pass instead of skipping the row.
fn aborts_pass(err: &SyncError) -> bool {
    matches!(err, SyncError::Connection(_) | SyncError::Io { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_classification() {
        assert!(aborts_pass(&SyncError::Connection("gone".into())));
        assert!(aborts_pass(&SyncError::io("/x", std::io::Error::other("disk"))));
        assert!(!aborts_pass(&SyncError::Parse("bad".into())));
        assert!(!aborts_pass(&SyncError::Database("no table".into())));
    }

    #[tokio::test]
    async fn test_trigger_coalesces_pokes() {
        let trigger = ForwardTrigger::default();
        trigger.poke();
        trigger.poke();
        trigger.notified().await;
        let second = tokio::time::timeout(Duration::from_millis(20), trigger.notified()).await;
        assert!(second.is_err());
    }
}
