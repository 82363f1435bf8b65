// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transactional replay of mirror records into the relational store.
//!
//! Each replayed change is one transaction: entity row, side collection,
//! child rows and the ledger row all commit together or not at all.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::AnyConnection;
use tracing::debug;

use crate::change::{id_string, ChangeType};
use crate::entity::{ChildRows, EntityDef, SideCollection};
use crate::storage::mirror::member_set;
use crate::storage::sql::{bind_json, quote, SqlStore};
use crate::storage::traits::{ReplaySink, SyncError};

#[async_trait]
impl ReplaySink for SqlStore {
    async fn replay_delete(&self, entity: &EntityDef, id: &str) -> Result<i64, SyncError> {
        let mut tx = self.pool().begin().await?;

        if let Some(side) = &entity.side {
            delete_owned(&mut tx, &side.table, &side.owner_column, id).await?;
        }
        if let Some(children) = &entity.children {
            delete_owned(&mut tx, &children.table, &children.owner_column, id).await?;
        }
        let sql = format!("DELETE FROM {} WHERE id = ?", quote(&entity.table));
        let deleted = sqlx::query(&sql).bind(id.to_string()).execute(&mut *tx).await?;

        let change_data = serde_json::json!({ "id": id, "table": entity.table });
        let ledger_id = self.append_on(&mut tx, &ChangeType::Delete, &change_data).await?;
        tx.commit().await?;

        debug!(table = %entity.table, id, rows = deleted.rows_affected(), ledger_id, "Replayed delete");
        Ok(ledger_id)
    }

    async fn replay_upsert(&self, entity: &EntityDef, id: &str, record: &Value) -> Result<i64, SyncError> {
        let fields = record
            .as_object()
            .ok_or_else(|| SyncError::Parse(format!("{} '{}' is not a JSON object", entity.table, id)))?;

        // Column lookups go through the pool; resolve them before the
        // transaction takes its connection.
        let columns = self.table_columns(&entity.table).await?;
        let child_columns = match &entity.children {
            Some(children) if fields.get(&children.field).is_some_and(Value::is_array) => {
                Some(self.table_columns(&children.table).await?)
            }
            _ => None,
        };

        let mut tx = self.pool().begin().await?;

        if let Some(required) = &entity.requires {
            let target = fields.get(&required.field).and_then(id_string).unwrap_or_default();
            if target.is_empty() || !row_exists(&mut tx, &required.table, &target).await? {
                return Err(SyncError::Referential { table: required.table.clone(), id: target });
            }
        }

        let mut skip: Vec<&str> = Vec::new();
        if let Some(side) = &entity.side {
            skip.push(side.field.as_str());
        }
        if let Some(children) = &entity.children {
            skip.push(children.field.as_str());
        }

        let mut row = fields.clone();
        row.insert("id".to_string(), Value::String(id.to_string()));
        let names: Vec<&str> = columns
            .iter()
            .map(String::as_str)
            .filter(|c| !skip.contains(c) && row.contains_key(*c))
            .collect();
        if !names.contains(&"id") {
            return Err(SyncError::Database(format!("table '{}' has no id column", entity.table)));
        }

        let sql = self.upsert_sql(&entity.table, &names);
        let mut query = sqlx::query(&sql);
        for name in &names {
            query = bind_json(query, &row[*name]);
        }
        if let Err(e) = query.execute(&mut *tx).await {
            // a column may have been dropped since the list was cached
            self.invalidate_columns(&entity.table);
            return Err(e.into());
        }

        if let Some(side) = &entity.side {
            if let Some(value) = fields.get(&side.field) {
                self.reconcile_side(&mut tx, side, id, value).await?;
            }
        }
        if let (Some(children), Some(child_columns)) = (&entity.children, &child_columns) {
            replace_children(self, &mut tx, children, child_columns, id, &fields[&children.field]).await?;
        }

        let mut change_data: Map<String, Value> = fields.clone();
        change_data.insert("table".to_string(), Value::String(entity.table.clone()));
        let ledger_id = self.append_on(&mut tx, &ChangeType::Update, &Value::Object(change_data)).await?;
        tx.commit().await?;

        debug!(table = %entity.table, id, columns = names.len(), ledger_id, "Replayed upsert");
        Ok(ledger_id)
    }
}

impl SqlStore {
    /// Bring a side table in line with the mirror's collection by inserting
    /// missing members and deleting stale ones. Existing rows are untouched.
    async fn reconcile_side(
        &self,
        conn: &mut AnyConnection,
        side: &SideCollection,
        owner_id: &str,
        desired: &Value,
    ) -> Result<(), SyncError> {
        let desired = member_set(desired);
        let current: BTreeSet<String> = self
            .side_values(conn, &side.table, &side.owner_column, &side.value_column, owner_id)
            .await?
            .into_iter()
            .collect();

        let insert = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            quote(&side.table),
            quote(&side.owner_column),
            quote(&side.value_column)
        );
        for member in desired.difference(&current) {
            sqlx::query(&insert)
                .bind(owner_id.to_string())
                .bind(member.clone())
                .execute(&mut *conn)
                .await?;
        }

        let delete = format!(
            "DELETE FROM {} WHERE {} = ? AND {} = ?",
            quote(&side.table),
            quote(&side.owner_column),
            quote(&side.value_column)
        );
        for member in current.difference(&desired) {
            sqlx::query(&delete)
                .bind(owner_id.to_string())
                .bind(member.clone())
                .execute(&mut *conn)
                .await?;
        }

        debug!(
            table = %side.table,
            owner = owner_id,
            added = desired.difference(&current).count(),
            removed = current.difference(&desired).count(),
            "Reconciled side collection"
        );
        Ok(())
    }
}

/// Child rows are owned outright by the parent: drop and re-insert.
async fn replace_children(
    store: &SqlStore,
    conn: &mut AnyConnection,
    children: &ChildRows,
    columns: &[String],
    owner_id: &str,
    items: &Value,
) -> Result<(), SyncError> {
    delete_owned(conn, &children.table, &children.owner_column, owner_id).await?;

    let Some(items) = items.as_array() else {
        return Ok(());
    };
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let mut obj = obj.clone();
        obj.insert(children.owner_column.clone(), Value::String(owner_id.to_string()));
        let names: Vec<&str> = columns
            .iter()
            .map(String::as_str)
            .filter(|c| obj.contains_key(*c))
            .collect();

        let sql = store.insert_sql(&children.table, &names);
        let mut query = sqlx::query(&sql);
        for name in &names {
            query = bind_json(query, &obj[*name]);
        }
        query.execute(&mut *conn).await?;
    }
    Ok(())
}

async fn delete_owned(conn: &mut AnyConnection, table: &str, owner_column: &str, owner_id: &str) -> Result<u64, SyncError> {
    let sql = format!("DELETE FROM {} WHERE {} = ?", quote(table), quote(owner_column));
    let result = sqlx::query(&sql).bind(owner_id.to_string()).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn row_exists(conn: &mut AnyConnection, table: &str, id: &str) -> Result<bool, SyncError> {
    let sql = format!("SELECT 1 AS present FROM {} WHERE id = ? LIMIT 1", quote(table));
    let row = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&mut *conn).await?;
    Ok(row.is_some())
}
