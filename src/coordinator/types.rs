// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync service coordinator.

/// Service lifecycle state.
///
/// Use [`super::SyncService::state()`] to check the current state or
/// [`super::SyncService::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Just created, not yet started
    Created,
    /// Connecting to the relational store and preparing directories
    Connecting,
    /// Connected, loops not yet spawned
    Ready,
    /// Forward and reverse loops running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
