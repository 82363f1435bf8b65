// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON mirror files: one array of records per entity.
//!
//! The mirror is a derived cache of the relational store, also written by
//! the application's route handlers. Updates here are write-suppressed: a
//! file is only rewritten when the serialized records actually change.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::change::id_string;
use crate::entity::EntityDef;
use crate::storage::json_file::{read_json, write_json_atomic};
use crate::storage::sql::parse_instant;
use crate::storage::traits::SyncError;

/// Effect of a mirror operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorChange {
    Inserted,
    Updated,
    Removed,
    /// Nothing written (content identical, or delete of an absent id)
    Unchanged,
}

impl MirrorChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorChange::Inserted => "inserted",
            MirrorChange::Updated => "updated",
            MirrorChange::Removed => "removed",
            MirrorChange::Unchanged => "unchanged",
        }
    }

    #[must_use]
    pub fn wrote(&self) -> bool {
        !matches!(self, MirrorChange::Unchanged)
    }
}

pub struct MirrorStore {
    dir: PathBuf,
}

impl MirrorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, entity: &EntityDef) -> PathBuf {
        self.dir.join(entity.mirror_file())
    }

    /// All records; a missing file is an empty mirror.
    pub async fn load(&self, entity: &EntityDef) -> Result<Vec<Value>, SyncError> {
        let path = self.path(entity);
        match read_json::<Value>(&path).await? {
            None => Ok(Vec::new()),
            Some(Value::Array(records)) => Ok(records),
            Some(_) => Err(SyncError::Parse(format!("{} is not a JSON array", path.display()))),
        }
    }

    pub async fn save(&self, entity: &EntityDef, records: &[Value]) -> Result<(), SyncError> {
        write_json_atomic(&self.path(entity), records).await
    }

    pub async fn find(&self, entity: &EntityDef, id: &str) -> Result<Option<Value>, SyncError> {
        let records = self.load(entity).await?;
        Ok(records.into_iter().find(|r| record_id(r).as_deref() == Some(id)))
    }

    /// Overlay `canonical` onto the record with the same id, or append it.
    pub async fn upsert(&self, entity: &EntityDef, canonical: Value) -> Result<MirrorChange, SyncError> {
        let id = record_id(&canonical)
            .ok_or_else(|| SyncError::Parse(format!("{} record without id", entity.table)))?;
        let mut records = self.load(entity).await?;
        let set_fields: Vec<&str> = entity.side.iter().map(|s| s.field.as_str()).collect();

        let change = match records.iter().position(|r| record_id(r).as_deref() == Some(id.as_str())) {
            Some(idx) => {
                let merged = merge_record(&records[idx], canonical, &set_fields);
                if same_content(&records[idx], &merged) {
                    debug!(entity = %entity.name, id = %id, "Mirror record already up to date");
                    return Ok(MirrorChange::Unchanged);
                }
                records[idx] = merged;
                MirrorChange::Updated
            }
            None => {
                records.push(canonical);
                MirrorChange::Inserted
            }
        };

        self.save(entity, &records).await?;
        debug!(entity = %entity.name, id = %id, ?change, "Mirror record written");
        Ok(change)
    }

    /// Remove the record with this id; removing an absent id is a no-op.
    pub async fn remove(&self, entity: &EntityDef, id: &str) -> Result<MirrorChange, SyncError> {
        let mut records = self.load(entity).await?;
        let before = records.len();
        records.retain(|r| record_id(r).as_deref() != Some(id));
        if records.len() == before {
            debug!(entity = %entity.name, id = %id, "Mirror record already absent");
            return Ok(MirrorChange::Unchanged);
        }
        self.save(entity, &records).await?;
        Ok(MirrorChange::Removed)
    }
}

/// String form of a record's `id` field.
pub fn record_id(record: &Value) -> Option<String> {
    record.get("id").and_then(id_string)
}

/// Existing record with canonical fields laid over it. Fields only the
/// mirror knows about survive; collection fields listed in `set_fields`
/// keep the mirror's ordering when they hold the same members, and
/// timestamps naming the same instant keep the mirror's spelling. Null
/// columns the mirror record never carried are not added.
pub fn merge_record(existing: &Value, canonical: Value, set_fields: &[&str]) -> Value {
    let (Some(existing_obj), Value::Object(canonical_obj)) = (existing.as_object(), &canonical) else {
        return canonical;
    };
    let mut merged: Map<String, Value> = existing_obj.clone();
    for (key, value) in canonical_obj {
        if value.is_null() && !existing_obj.contains_key(key) {
            continue;
        }
        if set_fields.contains(&key.as_str()) {
            if let Some(current) = existing_obj.get(key) {
                if same_members(current, value) {
                    continue;
                }
            }
        }
        if let (Some(Value::String(current)), Value::String(fresh)) = (existing_obj.get(key), value) {
            if same_instant(current, fresh) {
                continue;
            }
        }
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Members of a scalar array as strings (`["1", "a"]` for `[1, "a"]`).
pub fn member_set(value: &Value) -> BTreeSet<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(id_string).collect(),
        _ => BTreeSet::new(),
    }
}

fn same_members(a: &Value, b: &Value) -> bool {
    a.is_array() && b.is_array() && member_set(a) == member_set(b)
}

fn same_instant(a: &str, b: &str) -> bool {
    match (parse_instant(a), parse_instant(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn same_content(a: &Value, b: &Value) -> bool {
    match (serde_json::to_vec(a), serde_json::to_vec(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRegistry;
    use serde_json::json;

    fn products() -> EntityDef {
        EntityRegistry::default().by_name("products").unwrap().clone()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_suppresses_identical_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(dir.path());
        let entity = products();

        let record = json!({"id": "p1", "name": "Ring", "price": 100});
        assert_eq!(store.upsert(&entity, record.clone()).await.unwrap(), MirrorChange::Inserted);

        let modified = std::fs::metadata(store.path(&entity)).unwrap().modified().unwrap();
        assert_eq!(store.upsert(&entity, record).await.unwrap(), MirrorChange::Unchanged);
        let after = std::fs::metadata(store.path(&entity)).unwrap().modified().unwrap();
        assert_eq!(modified, after);
    }

    #[tokio::test]
    async fn test_upsert_overlays_and_keeps_mirror_only_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(dir.path());
        let entity = products();
        store.save(&entity, &[json!({"id": "p1", "name": "Ring", "category": "Gold"})]).await.unwrap();

        let change = store.upsert(&entity, json!({"id": "p1", "name": "Gold Ring"})).await.unwrap();
        assert_eq!(change, MirrorChange::Updated);
        let record = store.find(&entity, "p1").await.unwrap().unwrap();
        assert_eq!(record["name"], "Gold Ring");
        assert_eq!(record["category"], "Gold");
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(dir.path());
        let entity = products();
        assert_eq!(store.remove(&entity, "ghost").await.unwrap(), MirrorChange::Unchanged);
        assert!(!store.path(&entity).exists());

        store.save(&entity, &[json!({"id": 5}), json!({"id": "6"})]).await.unwrap();
        assert_eq!(store.remove(&entity, "5").await.unwrap(), MirrorChange::Removed);
        assert_eq!(store.load(&entity).await.unwrap(), vec![json!({"id": "6"})]);
    }

    #[tokio::test]
    async fn test_non_array_mirror_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(dir.path());
        let entity = products();
        std::fs::write(store.path(&entity), r#"{"id": "p1"}"#).unwrap();
        assert!(matches!(store.load(&entity).await, Err(SyncError::Parse(_))));
    }

    #[test]
    fn test_merge_keeps_mirror_spelling_of_same_instant() {
        let existing = json!({"id": "s1", "createdAt": "2025-01-01T15:30:00+05:30", "updatedAt": "2025-01-01T10:00:00.000Z"});
        let canonical = json!({"id": "s1", "createdAt": "2025-01-01T10:00:00.000Z", "updatedAt": "2025-01-02T10:00:00.000Z"});

        let merged = merge_record(&existing, canonical, &[]);
        assert_eq!(merged["createdAt"], "2025-01-01T15:30:00+05:30");
        assert_eq!(merged["updatedAt"], "2025-01-02T10:00:00.000Z");
        assert_eq!(merge_record(&merged, json!({"id": "s1", "createdAt": "2025-01-01 10:00:00"}), &[]), merged);
        assert_eq!(merge_record(&merged, json!({"id": "s1", "address": null}), &[]), merged);
    }

    #[test]
    fn test_merge_keeps_mirror_order_for_equal_sets() {
        let existing = json!({"id": "p1", "barcodes": ["B2", "B1"]});
        let merged = merge_record(&existing, json!({"id": "p1", "barcodes": ["B1", "B2"]}), &["barcodes"]);
        assert_eq!(merged["barcodes"], json!(["B2", "B1"]));

        let merged = merge_record(&existing, json!({"id": "p1", "barcodes": ["B1"]}), &["barcodes"]);
        assert_eq!(merged["barcodes"], json!(["B1"]));
    }
}
