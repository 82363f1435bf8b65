// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for mirror-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `mirror_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `direction`: forward, reverse, bulk
//! - `entity`: mirror name (products, users, ...)
//! - `outcome`: applied, unchanged, skipped, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of one ledger row in forward sync
pub fn record_ledger_row(change_type: &str, outcome: &str) {
    counter!(
        "mirror_sync_ledger_rows_total",
        "change_type" => change_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a mirror file rewrite
pub fn record_mirror_write(entity: &str, change: &str) {
    counter!(
        "mirror_sync_mirror_writes_total",
        "entity" => entity.to_string(),
        "change" => change.to_string()
    )
    .increment(1);
}

pub fn record_notification_created() {
    counter!("mirror_sync_notifications_created_total").increment(1);
}

/// Set the persisted forward cursor
pub fn set_forward_cursor(last_sync_id: i64) {
    gauge!("mirror_sync_forward_cursor").set(last_sync_id as f64);
}

/// Record the outcome of one audit log line in reverse sync
pub fn record_line(entity: &str, outcome: &str) {
    counter!(
        "mirror_sync_log_lines_total",
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the persisted line cursor of one audit log
pub fn set_file_cursor(file: &str, processed: usize) {
    gauge!(
        "mirror_sync_log_cursor",
        "file" => file.to_string()
    )
    .set(processed as f64);
}

/// Record a finished pass (forward) or run (reverse)
pub fn record_pass(direction: &str, status: &str) {
    counter!(
        "mirror_sync_passes_total",
        "direction" => direction.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record pass latency
pub fn record_pass_latency(direction: &str, duration: Duration) {
    histogram!(
        "mirror_sync_pass_seconds",
        "direction" => direction.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Overlapping reverse runs dropped by the re-entrancy guard
pub fn record_run_coalesced() {
    counter!("mirror_sync_runs_coalesced_total").increment(1);
}

pub fn set_connectivity(online: bool) {
    gauge!("mirror_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Record a connection-class failure that exhausted its retries
pub fn record_connection_error(operation: &str) {
    counter!(
        "mirror_sync_connection_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record expired audit logs removed by maintenance
pub fn record_logs_cleaned(count: usize) {
    counter!("mirror_sync_logs_cleaned_total").increment(count as u64);
}

/// Record rows inserted by the bulk loader
pub fn record_bulk_rows(table: &str, count: u64) {
    counter!(
        "mirror_sync_bulk_rows_total",
        "table" => table.to_string()
    )
    .increment(count);
}

/// Set service state (for monitoring state machine transitions)
pub fn set_service_state(state: &str) {
    counter!(
        "mirror_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records pass latency on drop
pub struct PassTimer {
    direction: &'static str,
    start: Instant,
}

impl PassTimer {
    pub fn new(direction: &'static str) -> Self {
        Self {
            direction,
            start: Instant::now(),
        }
    }
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        record_pass_latency(self.direction, self.start.elapsed());
    }
}
