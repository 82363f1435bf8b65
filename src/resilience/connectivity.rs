// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connectivity tracking for reverse sync.
//!
//! A [`ConnectivityMonitor`] samples a [`ReachabilityProbe`] and publishes
//! `Offline`/`Online` on a `watch` channel. Only the Offline→Online edge
//! matters to callers: it is reported by [`ConnectivityMonitor::check`] so
//! the owner can start a replay run immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::storage::traits::RecordSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Offline,
    Online,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Offline => write!(f, "Offline"),
            Connectivity::Online => write!(f, "Online"),
        }
    }
}

/// Cheap check of whether the network (or the database) is reachable.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Resolves a well-known host name.
pub struct DnsProbe {
    target: String,
    timeout: Duration,
}

impl DnsProbe {
    pub fn new(host: &str) -> Self {
        let target = if host.contains(':') { host.to_string() } else { format!("{}:80", host) };
        Self { target, timeout: Duration::from_secs(3) }
    }
}

#[async_trait]
impl ReachabilityProbe for DnsProbe {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, tokio::net::lookup_host(self.target.as_str())).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "DNS probe failed");
                false
            }
            Err(_) => {
                debug!(target = %self.target, "DNS probe timed out");
                false
            }
        }
    }
}

/// Round trip to the relational store itself.
pub struct SqlProbe {
    source: Arc<dyn RecordSource>,
}

impl SqlProbe {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ReachabilityProbe for SqlProbe {
    async fn probe(&self) -> bool {
        self.source.ping().await.is_ok()
    }
}

pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    state: watch::Sender<Connectivity>,
    failures: AtomicU32,
    offline_after: u32,
    /// Serializes probes (timer and manual checks)
    checking: Mutex<()>,
}

impl ConnectivityMonitor {
    /// Starts `Offline`, so the first successful probe counts as coming online.
    pub fn new(probe: Arc<dyn ReachabilityProbe>, offline_after: u32) -> Self {
        let (state, _) = watch::channel(Connectivity::Offline);
        Self {
            probe,
            state,
            failures: AtomicU32::new(0),
            offline_after: offline_after.max(1),
            checking: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Record a successful probe. Returns true on the Offline→Online edge.
    pub fn record_success(&self) -> bool {
        self.failures.store(0, Ordering::Release);
        let came_online = self.transition(Connectivity::Online);
        if came_online {
            info!("Connectivity restored");
        }
        came_online
    }

    /// Record a failed probe. Goes offline after `offline_after` in a row.
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.offline_after && self.transition(Connectivity::Offline) {
            warn!(failures, "Connectivity lost");
        }
    }

    /// Probe once. Returns true when this probe brought us back online.
    pub async fn check(&self) -> bool {
        let _guard = self.checking.lock().await;
        if self.probe.probe().await {
            self.record_success()
        } else {
            self.record_failure();
            false
        }
    }

    fn transition(&self, next: Connectivity) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

/// Holds a run flag for its lifetime; the flag clears on drop, including
/// when the run panics or returns early.
pub struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    /// `None` if a run already holds the flag.
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(RunGuard(flag))
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
