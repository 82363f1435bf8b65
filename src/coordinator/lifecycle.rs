// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: start, run, shutdown.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::forward::ForwardSync;
use crate::resilience::connectivity::{ConnectivityMonitor, DnsProbe, ReachabilityProbe, SqlProbe};
use crate::reverse::ReverseSync;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{ChangeLedger, RecordSource, ReplaySink, SyncError};

use super::{ServiceState, SyncService};

impl SyncService {
    /// Connect and prepare everything the loops need.
    ///
    /// Startup flow:
    /// 1. Validate the config
    /// 2. Connect to SQL (startup retry) and create the ledger if missing
    /// 3. Create mirror and log directories plus an empty inbox
    /// 4. Build both loops and wire reverse → forward re-trigger
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), SyncError> {
        let startup = std::time::Instant::now();
        self.set_state(ServiceState::Connecting);
        info!("Starting mirror sync service...");

        if let Err(e) = self.config.validate() {
            self.set_state(ServiceState::Created);
            return Err(e);
        }

        let store = match SqlStore::from_config(&self.config).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to connect to SQL - required for startup");
                crate::metrics::record_connection_error("startup");
                self.set_state(ServiceState::Created);
                return Err(e);
            }
        };
        info!(sqlite = store.is_sqlite(), ledger = %store.ledger_table(), "SQL connected");

        let ledger: Arc<dyn ChangeLedger> = store.clone();
        let source: Arc<dyn RecordSource> = store.clone();
        let sink: Arc<dyn ReplaySink> = store.clone();

        let forward = ForwardSync::new(&self.config, ledger, source.clone());
        forward.prepare().await?;

        let reverse = ReverseSync::new(&self.config, sink).with_forward_trigger(forward.trigger());

        let probe: Arc<dyn ReachabilityProbe> = if self.config.probe_host.trim().is_empty() {
            info!("No probe host configured, probing the SQL store");
            Arc::new(SqlProbe::new(source))
        } else {
            Arc::new(DnsProbe::new(&self.config.probe_host))
        };
        let monitor = ConnectivityMonitor::new(probe, self.config.offline_after_failures);

        self.store = Some(store);
        self.forward = Some(Arc::new(forward));
        self.reverse = Some(Arc::new(reverse));
        self.monitor = Some(Arc::new(monitor));

        self.set_state(ServiceState::Ready);
        info!(elapsed_ms = startup.elapsed().as_millis() as u64, "Mirror sync service ready");
        Ok(())
    }

    /// Spawn the forward and reverse loops. Requires a prior `start`.
    #[tracing::instrument(skip(self))]
    pub fn run(&self) -> Result<(), SyncError> {
        if self.state() != ServiceState::Ready {
            return Err(SyncError::Config(format!("cannot run from state {}", self.state())));
        }
        let forward = self.forward()?;
        let reverse = self.reverse()?;
        let monitor = self.connectivity()?;

        let forward_shutdown = self.shutdown.subscribe();
        let reverse_shutdown = self.shutdown.subscribe();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(async move { forward.run(forward_shutdown).await }));
        tasks.push(tokio::spawn(async move { reverse.run(monitor, reverse_shutdown).await }));
        drop(tasks);

        self.set_state(ServiceState::Running);
        info!("Mirror sync service running");
        Ok(())
    }

    /// Signal both loops, wait for them to finish their current pass, then
    /// close the pool.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Initiating mirror sync shutdown...");
        self.set_state(ServiceState::ShuttingDown);
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }

        if let Some(store) = &self.store {
            store.close().await;
        }
        info!("Mirror sync shutdown complete");
    }
}
