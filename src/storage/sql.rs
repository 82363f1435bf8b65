// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL access for the change ledger, canonical records and replay.
//!
//! Production runs against MySQL; tests run the same code against SQLite
//! through sqlx's `Any` driver.
//!
//! Ledger schema:
//! ```sql
//! CREATE TABLE sync_table (
//!   id BIGINT AUTO_INCREMENT PRIMARY KEY,
//!   sync_time DATETIME DEFAULT CURRENT_TIMESTAMP,
//!   change_type VARCHAR(32) NOT NULL,
//!   change_data JSON
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver cannot decode MySQL `DATETIME`, `JSON` or `DECIMAL`
//! columns, and hands back `LONGTEXT` as bytes. Every read therefore casts
//! to text in SQL (`CAST(x AS CHAR)`), canonical rows are fetched as a
//! single `JSON_OBJECT(...)` document, and text columns are decoded with
//! [`text_column`] which accepts either representation.

use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyConnection, AnyPool, Row};
use tracing::{debug, warn};

use crate::change::{decode_change_data, ChangeRecord, ChangeType};
use crate::config::SyncConfig;
use crate::entity::{is_safe_identifier, EntityDef};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{ChangeLedger, RecordSource, SyncError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub(crate) type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    ledger_table: String,
    columns: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the ledger table if missing.
    pub async fn new(connection_string: &str, ledger_table: &str) -> Result<Self, SyncError> {
        install_drivers();

        if !is_safe_identifier(ledger_table) {
            return Err(SyncError::Config(format!("invalid ledger table name '{}'", ledger_table)));
        }
        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(SyncError::from)
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            ledger_table: ledger_table.to_string(),
            columns: RwLock::new(HashMap::new()),
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::new(&config.sql_url, &config.ledger_table).await
    }

    /// A clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    pub fn ledger_table(&self) -> &str {
        &self.ledger_table
    }

    /// Close the pool; in-flight queries finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn enable_wal_mode(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&self.pool).await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        let sql = if self.is_sqlite {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sync_time TEXT DEFAULT CURRENT_TIMESTAMP,
                    change_type TEXT NOT NULL,
                    change_data TEXT
                )",
                quote(&self.ledger_table)
            )
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    sync_time DATETIME DEFAULT CURRENT_TIMESTAMP,
                    change_type VARCHAR(32) NOT NULL,
                    change_data JSON
                )",
                quote(&self.ledger_table)
            )
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(&sql).execute(&self.pool).await.map_err(SyncError::from)
        })
        .await?;
        Ok(())
    }

    /// Column names of `table` in ordinal order, cached after the first
    /// successful lookup. Unknown tables are an error and are not cached.
    pub async fn table_columns(&self, table: &str) -> Result<Arc<Vec<String>>, SyncError> {
        if let Some(cols) = self.columns.read().get(table) {
            return Ok(cols.clone());
        }
        if !is_safe_identifier(table) {
            return Err(SyncError::Parse(format!("unsafe table name '{}'", table)));
        }

        let sql = if self.is_sqlite {
            "SELECT name AS column_name FROM pragma_table_info(?)"
        } else {
            "SELECT COLUMN_NAME AS column_name FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION"
        };
        let rows = sqlx::query(sql).bind(table).fetch_all(&self.pool).await?;

        let mut cols = Vec::with_capacity(rows.len());
        for row in &rows {
            match text_column(row, "column_name") {
                Some(name) if is_safe_identifier(&name) => cols.push(name),
                Some(name) => warn!(table, column = %name, "Skipping column with unsupported name"),
                None => {}
            }
        }
        if cols.is_empty() {
            return Err(SyncError::Database(format!("table '{}' does not exist", table)));
        }

        let cols = Arc::new(cols);
        self.columns.write().insert(table.to_string(), cols.clone());
        debug!(table, columns = cols.len(), "Cached table columns");
        Ok(cols)
    }

    /// Forget the cached column list of `table` so the next lookup
    /// re-reads the schema.
    pub fn invalidate_columns(&self, table: &str) {
        if self.columns.write().remove(table).is_some() {
            debug!(table, "Dropped cached table columns");
        }
    }

    /// `INSERT ... ON DUPLICATE KEY UPDATE` (MySQL) / `ON CONFLICT` (SQLite)
    /// keyed on `id`.
    pub(crate) fn upsert_sql(&self, table: &str, columns: &[&str]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<&str> = columns.iter().copied().filter(|c| *c != "id").collect();

        let head = format!("INSERT INTO {} ({}) VALUES ({})", quote(table), names.join(", "), placeholders);
        if self.is_sqlite {
            if updates.is_empty() {
                return format!("{} ON CONFLICT(id) DO NOTHING", head);
            }
            let set: Vec<String> = updates.iter().map(|c| format!("{0} = excluded.{0}", quote(c))).collect();
            format!("{} ON CONFLICT(id) DO UPDATE SET {}", head, set.join(", "))
        } else {
            if updates.is_empty() {
                return head.replacen("INSERT INTO", "INSERT IGNORE INTO", 1);
            }
            let set: Vec<String> = updates.iter().map(|c| format!("{0} = VALUES({0})", quote(c))).collect();
            format!("{} ON DUPLICATE KEY UPDATE {}", head, set.join(", "))
        }
    }

    pub(crate) fn insert_sql(&self, table: &str, columns: &[&str]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!("INSERT INTO {} ({}) VALUES ({})", quote(table), names.join(", "), placeholders)
    }

    /// Insert that silently skips rows whose key already exists.
    pub(crate) fn insert_ignore_sql(&self, table: &str, columns: &[&str]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let verb = if self.is_sqlite { "INSERT OR IGNORE INTO" } else { "INSERT IGNORE INTO" };
        format!("{} {} ({}) VALUES ({})", verb, quote(table), names.join(", "), placeholders)
    }

    /// Append a ledger row on an open connection or transaction.
    pub(crate) async fn append_on(
        &self,
        conn: &mut AnyConnection,
        change_type: &ChangeType,
        change_data: &Value,
    ) -> Result<i64, SyncError> {
        let sql = format!(
            "INSERT INTO {} (sync_time, change_type, change_data) VALUES (CURRENT_TIMESTAMP, ?, ?)",
            quote(&self.ledger_table)
        );
        let result = sqlx::query(&sql)
            .bind(change_type.as_str().to_string())
            .bind(serde_json::to_string(change_data)?)
            .execute(&mut *conn)
            .await?;

        // The Any bridge only reports insert ids for MySQL
        let id = if self.is_sqlite {
            let rowid: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
                .fetch_one(&mut *conn)
                .await?;
            Some(rowid)
        } else {
            result.last_insert_id()
        };
        id.ok_or_else(|| SyncError::Database("ledger insert returned no id".to_string()))
    }

    /// Values of a side collection for one owner, as strings.
    pub(crate) async fn side_values(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        owner_column: &str,
        value_column: &str,
        owner_id: &str,
    ) -> Result<Vec<String>, SyncError> {
        let sql = format!(
            "SELECT CAST({v} AS CHAR) AS member FROM {t} WHERE {o} = ? ORDER BY {v}",
            v = quote(value_column),
            t = quote(table),
            o = quote(owner_column),
        );
        let rows = sqlx::query(&sql).bind(owner_id.to_string()).fetch_all(&mut *conn).await?;
        Ok(rows.iter().filter_map(|row| text_column(row, "member")).collect())
    }

    /// One row of `entity.table` as a JSON object, or `None`.
    async fn fetch_row(&self, conn: &mut AnyConnection, entity: &EntityDef, id: &str) -> Result<Option<Value>, SyncError> {
        let columns = self.table_columns(&entity.table).await?;
        let pairs: Vec<String> = columns.iter().map(|c| format!("'{}', {}", c, quote(c))).collect();
        let sql = if self.is_sqlite {
            format!("SELECT json_object({}) AS doc FROM {} WHERE id = ?", pairs.join(", "), quote(&entity.table))
        } else {
            format!(
                "SELECT CAST(JSON_OBJECT({}) AS CHAR) AS doc FROM {} WHERE id = ?",
                pairs.join(", "),
                quote(&entity.table)
            )
        };

        let row = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&mut *conn).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let doc = text_column(&row, "doc")
            .ok_or_else(|| SyncError::Database(format!("{} '{}' returned no document", entity.table, id)))?;
        let mut record: Value = serde_json::from_str(&doc)?;
        if let Some(fields) = record.as_object_mut() {
            for value in fields.values_mut() {
                if let Some(rendered) = value.as_str().and_then(render_timestamp) {
                    *value = Value::String(rendered);
                }
            }
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl ChangeLedger for SqlStore {
    async fn fetch_after(&self, cursor: i64, limit: usize) -> Result<Vec<ChangeRecord>, SyncError> {
        let sql = format!(
            "SELECT id, CAST(sync_time AS CHAR) AS sync_time, change_type, \
             CAST(change_data AS CHAR) AS change_data \
             FROM {} WHERE id > ? ORDER BY id ASC LIMIT ?",
            quote(&self.ledger_table)
        );
        let rows = sqlx::query(&sql)
            .bind(cursor)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let change_type = ChangeType::from(text_column(row, "change_type").unwrap_or_default());
            // A row with unreadable data is still returned so the cursor can
            // move past it; consumers reject it when resolving its target.
            let change_data = match text_column(row, "change_data") {
                Some(raw) => decode_change_data(&raw).unwrap_or_else(|e| {
                    warn!(ledger_id = id, error = %e, "Undecodable change_data");
                    Value::Null
                }),
                None => Value::Null,
            };
            let sync_time = text_column(row, "sync_time")
                .map(|raw| render_timestamp(&raw).unwrap_or(raw))
                .unwrap_or_default();
            records.push(ChangeRecord {
                id,
                sync_time,
                change_type,
                change_data,
            });
        }
        Ok(records)
    }

    async fn append(&self, change_type: &ChangeType, change_data: &Value) -> Result<i64, SyncError> {
        let mut conn = self.pool.acquire().await?;
        self.append_on(&mut conn, change_type, change_data).await
    }
}

#[async_trait]
impl RecordSource for SqlStore {
    async fn fetch_record(&self, entity: &EntityDef, id: &str) -> Result<Option<Value>, SyncError> {
        let mut conn = self.pool.acquire().await?;
        let Some(mut record) = self.fetch_row(&mut conn, entity, id).await? else {
            return Ok(None);
        };

        if let (Some(side), Some(obj)) = (&entity.side, record.as_object_mut()) {
            let members = self
                .side_values(&mut conn, &side.table, &side.owner_column, &side.value_column, id)
                .await?;
            obj.insert(side.field.clone(), Value::from(members));
        }
        Ok(Some(record))
    }

    async fn ping(&self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Backtick-quote an identifier (accepted by both MySQL and SQLite).
pub(crate) fn quote(identifier: &str) -> String {
    format!("`{}`", identifier)
}

/// Read a text column that may come back as `TEXT` or as bytes.
pub(crate) fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .or_else(|| row.try_get::<Option<i64>, _>(column).ok().flatten().map(|n| n.to_string()))
}

/// Bind a JSON value as the closest SQL scalar. Objects and arrays are
/// stored as JSON text, ISO timestamps as SQL datetime text.
pub(crate) fn bind_json<'q>(query: AnyQuery<'q>, value: &Value) -> AnyQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(normalize_timestamp(s).unwrap_or_else(|| s.clone())),
        other => query.bind(other.to_string()),
    }
}

/// `2025-01-01T10:00:00.000Z` → `2025-01-01 10:00:00.000` (UTC).
/// `None` for anything that is not an RFC 3339 timestamp.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    if raw.len() < 20 || raw.as_bytes().get(10) != Some(&b'T') {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}

/// SQL datetime text (`2025-01-01 10:00:00[.fff…]`, read as UTC) →
/// `2025-01-01T10:00:00.000Z`. `None` for anything else.
pub fn render_timestamp(raw: &str) -> Option<String> {
    if raw.len() < 19 || raw.as_bytes().get(10) != Some(&b' ') {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// The instant named by an RFC 3339 string or by SQL datetime text.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    match raw.as_bytes().get(10) {
        Some(b'T') => DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc)),
        Some(b' ') => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc()),
        _ => None,
    }
}
