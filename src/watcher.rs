// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filesystem triggers for reverse sync.
//!
//! Emits the file name of every audit log that was created or written in
//! the log directory. Events are hints only: a missed event is picked up by
//! the periodic rescan.

use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::audit::is_audit_log;

pub fn start_log_watcher(
    log_dir: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<String>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for file in changed_logs(event) {
                let _ = tx.send(file);
            }
        }
    })?;
    watcher.watch(log_dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

fn changed_logs(event: Event) -> Vec<String> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| is_audit_log(name))
            .collect(),
        _ => Vec::new(),
    }
}
