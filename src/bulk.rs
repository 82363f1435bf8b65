// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One-shot seed of the relational store from bootstrap JSON.
//!
//! Reads `stores.json`, `users.json`, `products.json`, `bills.json` and
//! `settings.json` and inserts everything in a single transaction with
//! insert-if-absent semantics, so loading twice is harmless. Rows that
//! already exist are left as they are.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::AnyConnection;
use tracing::{info, warn};

use crate::storage::json_file::read_json;
use crate::storage::sql::{bind_json, SqlStore};
use crate::storage::traits::SyncError;

const STORE_COLUMNS: &[&str] = &["id", "name", "address", "phone", "status", "createdAt", "updatedAt"];
const USER_COLUMNS: &[&str] = &[
    "id", "name", "email", "password", "role", "status", "sessionDuration", "createdAt", "updatedAt",
];
const PRODUCT_COLUMNS: &[&str] = &["id", "name", "price", "stock", "description", "createdAt", "updatedAt"];
const CUSTOMER_COLUMNS: &[&str] = &["id", "name", "phone", "email", "address", "createdAt", "updatedAt"];
const BILL_COLUMNS: &[&str] = &[
    "id", "storeId", "storeName", "storeAddress", "customerName", "customerPhone", "customerEmail",
    "customerAddress", "customerId", "subtotal", "taxPercentage", "taxAmount", "discountPercentage",
    "discountAmount", "total", "paymentMethod", "timestamp", "notes", "gstin", "companyName",
    "companyAddress", "companyPhone", "companyEmail", "billFormat", "createdBy",
];
const BILL_ITEM_COLUMNS: &[&str] = &["billId", "productId", "productName", "quantity", "price", "total"];
const SETTINGS_COLUMNS: &[&str] = &[
    "gstin", "taxPercentage", "companyName", "companyAddress", "companyPhone", "companyEmail",
];

/// Rows inserted per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub inserted: BTreeMap<String, u64>,
}

impl BulkReport {
    pub fn count(&self, table: &str) -> u64 {
        self.inserted.get(table).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.inserted.values().sum()
    }

    fn add(&mut self, table: &str, rows: u64) {
        *self.inserted.entry(table.to_string()).or_insert(0) += rows;
    }
}

pub struct BulkLoader {
    store: Arc<SqlStore>,
    source_dir: PathBuf,
    log_dir: PathBuf,
}

impl BulkLoader {
    pub fn new(store: Arc<SqlStore>, source_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self { store, source_dir: source_dir.into(), log_dir: log_dir.into() }
    }

    /// Load everything or nothing. On success stamps `<log_dir>/sync.log`.
    #[tracing::instrument(skip(self), fields(source = %self.source_dir.display()))]
    pub async fn load(&self) -> Result<BulkReport, SyncError> {
        let stores = self.read_array("stores.json").await?;
        let users = self.read_array("users.json").await?;
        let products = self.read_array("products.json").await?;
        let bills = self.read_array("bills.json").await?;
        let settings: Option<Value> = read_json(&self.source_dir.join("settings.json")).await?;

        let mut report = BulkReport::default();
        let mut tx = self.store.pool().begin().await?;

        self.load_stores(&mut tx, &mut report, &stores).await?;
        self.load_users(&mut tx, &mut report, &users).await?;
        self.load_products(&mut tx, &mut report, &products).await?;
        self.load_bills(&mut tx, &mut report, &bills).await?;
        if let Some(settings) = &settings {
            self.load_settings(&mut tx, &mut report, settings).await?;
        }

        tx.commit().await?;

        for (table, rows) in &report.inserted {
            crate::metrics::record_bulk_rows(table, *rows);
        }
        self.stamp_sync_log().await?;
        info!(total = report.total(), tables = report.inserted.len(), "Bulk load committed");
        Ok(report)
    }

    async fn read_array(&self, file: &str) -> Result<Vec<Value>, SyncError> {
        let path = self.source_dir.join(file);
        match read_json::<Value>(&path).await? {
            Some(Value::Array(rows)) => Ok(rows),
            Some(_) => Err(SyncError::Parse(format!("{} is not a JSON array", path.display()))),
            None => {
                warn!(file, "Bootstrap file missing, nothing to load");
                Ok(Vec::new())
            }
        }
    }

    async fn load_stores(&self, conn: &mut AnyConnection, report: &mut BulkReport, stores: &[Value]) -> Result<(), SyncError> {
        for store in stores {
            let now = now_value();
            let values: Vec<Value> = STORE_COLUMNS
                .iter()
                .map(|c| match *c {
                    "createdAt" | "updatedAt" => field(store, c).cloned().unwrap_or_else(|| now.clone()),
                    _ => field_or_null(store, c),
                })
                .collect();
            self.insert(conn, report, "Stores", STORE_COLUMNS, &values).await?;
        }
        Ok(())
    }

    async fn load_users(&self, conn: &mut AnyConnection, report: &mut BulkReport, users: &[Value]) -> Result<(), SyncError> {
        for user in users {
            let values: Vec<Value> = USER_COLUMNS.iter().map(|c| field_or_null(user, c)).collect();
            self.insert(conn, report, "Users", USER_COLUMNS, &values).await?;

            for store_id in array(user, "assignedStores") {
                self.insert(conn, report, "UserStores", &["userId", "storeId"], &[field_or_null(user, "id"), store_id.clone()])
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_products(&self, conn: &mut AnyConnection, report: &mut BulkReport, products: &[Value]) -> Result<(), SyncError> {
        let mut categories: BTreeMap<String, String> = BTreeMap::new();
        for product in products {
            let product_id = field_or_null(product, "id");
            let values: Vec<Value> = PRODUCT_COLUMNS.iter().map(|c| field_or_null(product, c)).collect();
            self.insert(conn, report, "Products", PRODUCT_COLUMNS, &values).await?;

            if let Some(name) = product.get("category").and_then(Value::as_str).filter(|n| !n.is_empty()) {
                let category_id = match categories.get(name) {
                    Some(id) => id.clone(),
                    None => {
                        let id = slugify(name);
                        let now = now_value();
                        self.insert(
                            conn,
                            report,
                            "Categories",
                            &["id", "name", "createdAt", "updatedAt"],
                            &[Value::String(id.clone()), Value::String(name.to_string()), now.clone(), now],
                        )
                        .await?;
                        categories.insert(name.to_string(), id.clone());
                        id
                    }
                };
                self.insert(
                    conn,
                    report,
                    "ProductCategories",
                    &["productId", "categoryId"],
                    &[product_id.clone(), Value::String(category_id)],
                )
                .await?;
            }

            for barcode in array(product, "barcodes") {
                self.insert(conn, report, "ProductBarcodes", &["productId", "barcode"], &[product_id.clone(), barcode.clone()])
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_bills(&self, conn: &mut AnyConnection, report: &mut BulkReport, bills: &[Value]) -> Result<(), SyncError> {
        for bill in bills {
            // customers are keyed by phone number
            let customer_id = match bill.get("customerPhone").filter(|p| !is_blank(p)) {
                Some(phone) => {
                    let now = now_value();
                    let values = [
                        phone.clone(),
                        field_or_null(bill, "customerName"),
                        phone.clone(),
                        field_or_null(bill, "customerEmail"),
                        field_or_null(bill, "customerAddress"),
                        now.clone(),
                        now,
                    ];
                    self.insert(conn, report, "Customers", CUSTOMER_COLUMNS, &values).await?;
                    phone.clone()
                }
                None => Value::Null,
            };

            let values: Vec<Value> = BILL_COLUMNS
                .iter()
                .map(|c| if *c == "customerId" { customer_id.clone() } else { field_or_null(bill, c) })
                .collect();
            self.insert(conn, report, "Bills", BILL_COLUMNS, &values).await?;

            for item in array(bill, "items") {
                let values: Vec<Value> = BILL_ITEM_COLUMNS
                    .iter()
                    .map(|c| if *c == "billId" { field_or_null(bill, "id") } else { field_or_null(item, c) })
                    .collect();
                self.insert(conn, report, "BillItems", BILL_ITEM_COLUMNS, &values).await?;
            }
        }
        Ok(())
    }

    async fn load_settings(&self, conn: &mut AnyConnection, report: &mut BulkReport, settings: &Value) -> Result<(), SyncError> {
        if let Some(system) = settings.get("systemSettings").filter(|s| s.is_object()) {
            let values: Vec<Value> = SETTINGS_COLUMNS.iter().map(|c| field_or_null(system, c)).collect();
            self.insert(conn, report, "SystemSettings", SETTINGS_COLUMNS, &values).await?;
        }
        if let Some(formats) = settings.get("billFormats").and_then(Value::as_object) {
            for (name, format) in formats {
                self.insert(
                    conn,
                    report,
                    "BillFormats",
                    &["name", "format"],
                    &[Value::String(name.clone()), Value::String(format.to_string())],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn insert(
        &self,
        conn: &mut AnyConnection,
        report: &mut BulkReport,
        table: &str,
        columns: &[&str],
        values: &[Value],
    ) -> Result<(), SyncError> {
        let sql = self.store.insert_ignore_sql(table, columns);
        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_json(query, value);
        }
        let result = query.execute(&mut *conn).await?;
        report.add(table, result.rows_affected());
        Ok(())
    }

    async fn stamp_sync_log(&self) -> Result<(), SyncError> {
        let path = self.log_dir.join("sync.log");
        write_sync_stamp(&path).await
    }
}

async fn write_sync_stamp(path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
    }
    let line = format!("Last sync: {}\n", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    tokio::fs::write(path, line).await.map_err(|e| SyncError::io(path, e))
}

fn field<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    record.get(name).filter(|v| !v.is_null())
}

fn field_or_null(record: &Value, name: &str) -> Value {
    field(record, name).cloned().unwrap_or(Value::Null)
}

fn array<'a>(record: &'a Value, name: &str) -> &'a [Value] {
    record.get(name).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn now_value() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Category id from its display name: lowercase, whitespace runs → `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_space {
                slug.push('-');
            }
            in_space = true;
        } else {
            slug.extend(c.to_lowercase());
            in_space = false;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Gold Rings"), "gold-rings");
        assert_eq!(slugify("Silver   Anklets"), "silver-anklets");
        assert_eq!(slugify("Diamond"), "diamond");
    }

    #[test]
    fn test_field_helpers() {
        let bill = json!({"id": "b1", "notes": null, "customerPhone": "  ", "items": [{"productId": "p1"}]});
        assert_eq!(field_or_null(&bill, "notes"), Value::Null);
        assert_eq!(field_or_null(&bill, "missing"), Value::Null);
        assert!(is_blank(&bill["customerPhone"]));
        assert_eq!(array(&bill, "items").len(), 1);
        assert!(array(&bill, "barcodes").is_empty());
    }

    #[test]
    fn test_report_totals() {
        let mut report = BulkReport::default();
        report.add("Products", 2);
        report.add("Products", 1);
        report.add("Stores", 1);
        assert_eq!(report.count("Products"), 3);
        assert_eq!(report.count("Bills"), 0);
        assert_eq!(report.total(), 4);
    }

    #[tokio::test]
    async fn test_sync_stamp_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("sync.log");
        write_sync_stamp(&path).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Last sync: "));
        assert!(content.trim_end().ends_with('Z'));
    }
}
