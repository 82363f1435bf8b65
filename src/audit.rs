// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Audit log lines: one append-only file per entity (`products.json.log`).
//!
//! # Line Formats
//!
//! ## Structured event (preferred)
//! ```text
//! {"entityType":"products","id":"p2","action":"create","timestamp":"2025-01-01T10:00:00Z"}
//! ```
//!
//! ## Legacy prose
//! ```text
//! 2025-01-01T10:00:00.000Z - New product created: Ring (ID: p2)
//! 2025-01-01T10:05:00.000Z - Store deleted: Main Branch (ID: s1)
//! ```
//!
//! Prose lines carry the id in a `(ID: <id>)` tag. A line mentioning
//! `deleted` is a delete; anything else with an id is a create/update.
//! Lines matching neither shape are rejected with [`SyncError::Parse`].

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::change::id_string;
use crate::storage::traits::SyncError;

/// Log files in the audit directory that are never replayed.
pub const RESERVED_LOG_FILES: &[&str] = &["sync.log"];

const LOG_SUFFIX: &str = ".log";
const MIRROR_LOG_SUFFIX: &str = ".json.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, AuditAction::Delete)
    }
}

/// Structured audit event emitted by the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub entity_type: String,
    pub id: Value,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: Value::String(id.into()),
            action,
            timestamp: Utc::now(),
        }
    }

    /// Single-line JSON form, without the trailing newline.
    pub fn to_line(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What a single log line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub id: String,
    pub action: AuditAction,
    /// Entity named by a structured event; prose lines use the file's entity.
    pub entity: Option<String>,
}

/// Parse one non-empty log line.
pub fn parse_line(line: &str) -> Result<ParsedLine, SyncError> {
    let line = line.trim();
    if line.starts_with('{') {
        return parse_structured(line);
    }
    parse_prose(line)
}

fn parse_structured(line: &str) -> Result<ParsedLine, SyncError> {
    let event: AuditEvent = serde_json::from_str(line)
        .map_err(|e| SyncError::Parse(format!("malformed audit event: {}", e)))?;
    let id = id_string(&event.id)
        .ok_or_else(|| SyncError::Parse("audit event has no usable id".to_string()))?;
    Ok(ParsedLine { id, action: event.action, entity: Some(event.entity_type) })
}

fn parse_prose(line: &str) -> Result<ParsedLine, SyncError> {
    // "<timestamp> - <text>"; the timestamp itself is not needed for replay
    let text = line.split_once(" - ").map(|(_, rest)| rest).unwrap_or(line);
    let lower = text.to_ascii_lowercase();

    if lower.contains("deleted") {
        let id = tagged_id(text)
            .or_else(|| token_after_marker(text))
            .ok_or_else(|| SyncError::Parse(format!("delete line without id: {}", truncate(line))))?;
        return Ok(ParsedLine { id, action: AuditAction::Delete, entity: None });
    }

    let id = tagged_id(text)
        .ok_or_else(|| SyncError::Parse(format!("no (ID: ...) tag: {}", truncate(line))))?;
    let action = if lower.contains("created") { AuditAction::Create } else { AuditAction::Update };
    Ok(ParsedLine { id, action, entity: None })
}

/// Id inside the last `(ID: ...)` tag.
fn tagged_id(text: &str) -> Option<String> {
    let start = text.rfind("(ID:")? + "(ID:".len();
    let end = text[start..].find(')')? + start;
    let id = text[start..end].trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Token following an untagged `ID:` / `id=` marker.
fn token_after_marker(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    for marker in ["id:", "id="] {
        if let Some(pos) = lower.find(marker) {
            let rest = text[pos + marker.len()..].trim_start();
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if !token.is_empty() {
                return Some(token);
            }
        }
    }
    None
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Entity name for an audit log file, `None` for reserved or foreign files.
pub fn entity_from_log_file(file_name: &str) -> Option<&str> {
    if RESERVED_LOG_FILES.contains(&file_name) {
        return None;
    }
    let name = file_name
        .strip_suffix(MIRROR_LOG_SUFFIX)
        .or_else(|| file_name.strip_suffix(LOG_SUFFIX))?;
    (!name.is_empty()).then_some(name)
}

/// Whether a directory entry is a replayable audit log.
pub fn is_audit_log(file_name: &str) -> bool {
    file_name.ends_with(LOG_SUFFIX) && !RESERVED_LOG_FILES.contains(&file_name)
}

/// Append a structured event to `<log_dir>/<entity>.json.log`.
pub async fn append_event(log_dir: &Path, event: &AuditEvent) -> Result<(), SyncError> {
    let path = log_dir.join(format!("{}{}", event.entity_type, MIRROR_LOG_SUFFIX));
    let mut line = event.to_line()?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| SyncError::io(&path, e))?;
    file.write_all(line.as_bytes()).await.map_err(|e| SyncError::io(&path, e))?;
    file.flush().await.map_err(|e| SyncError::io(&path, e))?;
    Ok(())
}
