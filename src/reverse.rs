// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reverse sync: audit logs → relational store.
//!
//! Each `<entity>.json.log` has a line cursor in `processing_state.json`.
//! A run replays the unprocessed lines of every log in order:
//!
//! - delete lines remove the row (and its side/child rows);
//! - other lines upsert the current mirror record;
//! - every committed line also appends a ledger row, which is how the
//!   change reaches forward sync.
//!
//! Lines that cannot be parsed, name a record missing from the mirror, or
//! reference a missing user are skipped and the cursor moves past them.
//! Connection errors are retried a few times; any other error stops that
//! file before the failing line so the next run retries it.
//!
//! Runs happen only while online. Coming back online starts a run at once;
//! filesystem events and a periodic rescan start the others.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::{is_audit_log, parse_line, ParsedLine};
use crate::config::SyncConfig;
use crate::entity::{EntityDef, EntityRegistry};
use crate::forward::ForwardTrigger;
use crate::resilience::connectivity::{ConnectivityMonitor, RunGuard};
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::storage::mirror::MirrorStore;
use crate::storage::state::ProcessingStateStore;
use crate::storage::traits::{ReplaySink, SyncError};

/// Result of replaying one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Applied,
    Skipped,
}

/// Progress through one audit log during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReport {
    pub file: String,
    pub applied: usize,
    pub skipped: usize,
    /// Cursor after the run
    pub cursor: usize,
    /// The cursor was past the end of the file and restarted at 0
    pub rotated: bool,
    /// Processing stopped at a failing line
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseReport {
    pub files: Vec<FileReport>,
    /// Another run was in progress; nothing was done
    pub coalesced: bool,
}

impl ReverseReport {
    pub fn applied(&self) -> usize {
        self.files.iter().map(|f| f.applied).sum()
    }

    pub fn file(&self, name: &str) -> Option<&FileReport> {
        self.files.iter().find(|f| f.file == name)
    }
}

pub struct ReverseSync {
    sink: Arc<dyn ReplaySink>,
    mirrors: MirrorStore,
    processing: ProcessingStateStore,
    entities: EntityRegistry,
    log_dir: PathBuf,
    retry: RetryConfig,
    probe_interval: Duration,
    rescan_interval: Duration,
    running: AtomicBool,
    forward: Option<ForwardTrigger>,
}

impl ReverseSync {
    pub fn new(config: &SyncConfig, sink: Arc<dyn ReplaySink>) -> Self {
        Self {
            sink,
            mirrors: MirrorStore::new(&config.json_dir),
            processing: ProcessingStateStore::new(config.processing_state_path()),
            entities: config.entities.clone(),
            log_dir: config.log_dir.clone(),
            retry: RetryConfig::fixed(config.retry_attempts, config.retry_delay()),
            probe_interval: config.probe_interval(),
            rescan_interval: config.reverse_rescan_interval(),
            running: AtomicBool::new(false),
            forward: None,
        }
    }

    /// Poke forward sync whenever a run commits at least one line.
    pub fn with_forward_trigger(mut self, trigger: ForwardTrigger) -> Self {
        self.forward = Some(trigger);
        self
    }

    /// Replay every audit log once. Returns a coalesced report if a run is
    /// already in progress.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReverseReport, SyncError> {
        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            debug!("Reverse run already in progress, skipping");
            crate::metrics::record_run_coalesced();
            return Ok(ReverseReport { coalesced: true, ..Default::default() });
        };
        let _timer = crate::metrics::PassTimer::new("reverse");

        let mut report = ReverseReport::default();
        for name in self.log_files().await? {
            if self.entities.for_log_file(&name).is_none() {
                debug!(file = %name, "No entity for log file, skipping");
                continue;
            }
            match self.process_file(&name).await {
                Ok(file_report) => report.files.push(file_report),
                Err(e) => {
                    error!(file = %name, error = %e, "Failed to process log file");
                    report.files.push(FileReport { file: name, failed: true, ..Default::default() });
                }
            }
        }

        let applied = report.applied();
        if applied > 0 {
            info!(applied, files = report.files.len(), "Reverse run committed changes");
            if let Some(forward) = &self.forward {
                forward.poke();
            }
        }
        let status = if report.files.iter().any(|f| f.failed) { "partial" } else { "success" };
        crate::metrics::record_pass("reverse", status);
        Ok(report)
    }

    /// Audit logs in the log directory, sorted by name.
    async fn log_files(&self) -> Result<Vec<String>, SyncError> {
        let mut dir = match tokio::fs::read_dir(&self.log_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(&self.log_dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| SyncError::io(&self.log_dir, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_audit_log(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Replay the unprocessed lines of one audit log and save its cursor.
    pub async fn process_file(&self, file_name: &str) -> Result<FileReport, SyncError> {
        let entity = self
            .entities
            .for_log_file(file_name)
            .ok_or_else(|| SyncError::Parse(format!("no entity for log file '{}'", file_name)))?;
        let path = self.log_dir.join(file_name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(SyncError::io(&path, e)),
        };
        let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        let mut report = FileReport { file: file_name.to_string(), ..Default::default() };
        let saved = self.processing.get(file_name).await?;
        let mut cursor = saved;
        if cursor > lines.len() {
            warn!(file = %file_name, cursor, lines = lines.len(), "Log file shrank (rotated?), restarting from line 0");
            cursor = 0;
            report.rotated = true;
        }

        for line in &lines[cursor..] {
            let parsed = match parse_line(line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(file = %file_name, line = cursor + 1, error = %e, "Skipping unparsable log line");
                    crate::metrics::record_line(&entity.name, "unparsable");
                    report.skipped += 1;
                    cursor += 1;
                    continue;
                }
            };

            let target = match self.line_entity(entity, &parsed) {
                Some(target) => target,
                None => {
                    warn!(file = %file_name, entity = ?parsed.entity, "Log line names an unknown entity, skipping");
                    crate::metrics::record_line(&entity.name, "skipped");
                    report.skipped += 1;
                    cursor += 1;
                    continue;
                }
            };

            let outcome = retry_when(
                "replay_line",
                &self.retry,
                || self.replay_line(target, &parsed),
                SyncError::is_transient,
            )
            .await;

            match outcome {
                Ok(LineOutcome::Applied) => {
                    crate::metrics::record_line(&target.name, "applied");
                    report.applied += 1;
                }
                Ok(LineOutcome::Skipped) => {
                    crate::metrics::record_line(&target.name, "skipped");
                    report.skipped += 1;
                }
                Err(SyncError::Referential { table, id }) => {
                    warn!(file = %file_name, record = %parsed.id, table = %table, missing = %id, "Missing reference, skipping line");
                    crate::metrics::record_line(&target.name, "skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        file = %file_name,
                        line = cursor + 1,
                        record = %parsed.id,
                        error = %e,
                        "Replay failed, stopping this file"
                    );
                    if e.is_transient() {
                        crate::metrics::record_connection_error("replay_line");
                    }
                    crate::metrics::record_line(&target.name, "failed");
                    report.failed = true;
                    break;
                }
            }
            cursor += 1;
        }

        if cursor != saved {
            self.processing.set(file_name, cursor).await?;
        }
        crate::metrics::set_file_cursor(file_name, cursor);
        report.cursor = cursor;
        debug!(file = %file_name, applied = report.applied, skipped = report.skipped, cursor, "Log file processed");
        Ok(report)
    }

    /// Structured events name their entity; prose lines belong to the file's.
    fn line_entity<'a>(&'a self, file_entity: &'a EntityDef, parsed: &ParsedLine) -> Option<&'a EntityDef> {
        match &parsed.entity {
            Some(name) if !name.eq_ignore_ascii_case(&file_entity.name) => self.entities.by_name(name),
            _ => Some(file_entity),
        }
    }

    async fn replay_line(&self, entity: &EntityDef, parsed: &ParsedLine) -> Result<LineOutcome, SyncError> {
        if parsed.action.is_delete() {
            let ledger_id = self.sink.replay_delete(entity, &parsed.id).await?;
            debug!(entity = %entity.name, id = %parsed.id, ledger_id, "Delete replayed");
            return Ok(LineOutcome::Applied);
        }

        let Some(record) = self.mirrors.find(entity, &parsed.id).await? else {
            warn!(entity = %entity.name, id = %parsed.id, "Record not in mirror, skipping");
            return Ok(LineOutcome::Skipped);
        };
        let ledger_id = self.sink.replay_upsert(entity, &parsed.id, &record).await?;
        debug!(entity = %entity.name, id = %parsed.id, action = parsed.action.as_str(), ledger_id, "Upsert replayed");
        Ok(LineOutcome::Applied)
    }

    async fn run_logged(&self) {
        if let Err(e) = self.run_once().await {
            error!(error = %e, "Reverse run failed");
        }
    }

    /// Probe connectivity, react to file events and rescan until `shutdown`
    /// flips to true.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, monitor: Arc<ConnectivityMonitor>, mut shutdown: watch::Receiver<bool>) {
        let (_watcher, mut events) = match crate::watcher::start_log_watcher(&self.log_dir) {
            Ok((watcher, events)) => (Some(watcher), Some(events)),
            Err(e) => {
                warn!(dir = %self.log_dir.display(), error = %e, "File watcher unavailable, relying on rescan");
                (None, None)
            }
        };
        info!(
            probe_secs = self.probe_interval.as_secs(),
            rescan_secs = self.rescan_interval.as_secs(),
            "Reverse sync running"
        );

        let mut probe = interval(self.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rescan = interval_at(Instant::now() + self.rescan_interval, self.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = probe.tick() => {
                    let came_online = monitor.check().await;
                    crate::metrics::set_connectivity(monitor.is_online());
                    if came_online {
                        info!("Back online, replaying audit logs");
                        self.run_logged().await;
                    }
                }
                Some(file) = next_event(&mut events) => {
                    // collapse a burst of appends into one run
                    let mut burst = 1;
                    if let Some(rx) = events.as_mut() {
                        while rx.try_recv().is_ok() {
                            burst += 1;
                        }
                    }
                    debug!(file = %file, burst, "Audit log changed");
                    if monitor.is_online() {
                        self.run_logged().await;
                    }
                }
                _ = rescan.tick() => {
                    if monitor.is_online() {
                        self.run_logged().await;
                    }
                }
            }
        }
        info!("Reverse sync stopped");
    }
}

async fn next_event(events: &mut Option<tokio::sync::mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
