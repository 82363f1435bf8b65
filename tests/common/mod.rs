// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures: a temp directory with `json/` and `logs/`, a SQLite
//! database with the shop's business tables, and file helpers.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use sqlx::Row;
use tempfile::TempDir;

use mirror_sync::{SqlStore, SyncConfig};

const BUSINESS_TABLES: &[&str] = &[
    "CREATE TABLE Stores (id TEXT PRIMARY KEY, name TEXT, address TEXT, phone TEXT, status TEXT,
        createdAt TEXT, updatedAt TEXT)",
    "CREATE TABLE Users (id TEXT PRIMARY KEY, name TEXT, email TEXT, password TEXT, role TEXT,
        status TEXT, sessionDuration INTEGER, createdAt TEXT, updatedAt TEXT)",
    "CREATE TABLE UserStores (userId TEXT, storeId TEXT, PRIMARY KEY (userId, storeId))",
    "CREATE TABLE Products (id TEXT PRIMARY KEY, name TEXT, price REAL, stock INTEGER,
        description TEXT, createdAt TEXT, updatedAt TEXT)",
    "CREATE TABLE ProductBarcodes (productId TEXT, barcode TEXT, PRIMARY KEY (productId, barcode))",
    "CREATE TABLE Categories (id TEXT PRIMARY KEY, name TEXT, createdAt TEXT, updatedAt TEXT)",
    "CREATE TABLE ProductCategories (productId TEXT, categoryId TEXT, PRIMARY KEY (productId, categoryId))",
    "CREATE TABLE Customers (id TEXT PRIMARY KEY, name TEXT, phone TEXT, email TEXT, address TEXT,
        createdAt TEXT, updatedAt TEXT)",
    "CREATE TABLE Bills (id TEXT PRIMARY KEY, storeId TEXT, storeName TEXT, storeAddress TEXT,
        customerName TEXT, customerPhone TEXT, customerEmail TEXT, customerAddress TEXT,
        customerId TEXT, subtotal REAL, taxPercentage REAL, taxAmount REAL,
        discountPercentage REAL, discountAmount REAL, total REAL, paymentMethod TEXT,
        timestamp TEXT, notes TEXT, gstin TEXT, companyName TEXT, companyAddress TEXT,
        companyPhone TEXT, companyEmail TEXT, billFormat TEXT, createdBy TEXT)",
    "CREATE TABLE BillItems (billId TEXT, productId TEXT, productName TEXT, quantity INTEGER,
        price REAL, total REAL, PRIMARY KEY (billId, productId))",
    "CREATE TABLE SystemSettings (gstin TEXT PRIMARY KEY, taxPercentage REAL, companyName TEXT,
        companyAddress TEXT, companyPhone TEXT, companyEmail TEXT)",
    "CREATE TABLE BillFormats (name TEXT PRIMARY KEY, format TEXT)",
];

pub struct TestEnv {
    pub dir: TempDir,
    pub config: SyncConfig,
    pub store: Arc<SqlStore>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_dir = dir.path().join("json");
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&json_dir).unwrap();
        std::fs::create_dir_all(&log_dir).unwrap();

        let config = SyncConfig {
            sql_url: format!("sqlite://{}?mode=rwc", dir.path().join("shop.db").display()),
            json_dir,
            log_dir,
            probe_host: String::new(),
            retry_attempts: 3,
            retry_delay_ms: 10,
            ..Default::default()
        };

        let store = Arc::new(SqlStore::from_config(&config).await.expect("sqlite store"));
        let pool = store.pool();
        for ddl in BUSINESS_TABLES {
            sqlx::query(ddl).execute(&pool).await.expect("create table");
        }
        Self { dir, config, store }
    }

    pub fn mirror_path(&self, entity: &str) -> PathBuf {
        self.config.json_dir.join(format!("{}.json", entity))
    }

    pub fn log_path(&self, file: &str) -> PathBuf {
        self.config.log_dir.join(file)
    }

    pub fn write_mirror(&self, entity: &str, records: Value) {
        std::fs::write(self.mirror_path(entity), serde_json::to_vec_pretty(&records).unwrap()).unwrap();
    }

    pub fn read_mirror(&self, entity: &str) -> Vec<Value> {
        read_json_file(&self.mirror_path(entity)).and_then(|v| v.as_array().cloned()).unwrap_or_default()
    }

    pub fn append_log(&self, file: &str, lines: &[&str]) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(file))
            .unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    pub fn sync_state(&self) -> Option<Value> {
        read_json_file(&self.config.sync_state_path())
    }

    pub fn processing_state(&self) -> Value {
        read_json_file(&self.config.processing_state_path()).unwrap_or(Value::Null)
    }

    pub fn notifications(&self) -> Vec<Value> {
        read_json_file(&self.config.notifications_path())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    pub async fn exec(&self, sql: &str) {
        sqlx::query(sql).execute(&self.store.pool()).await.expect(sql);
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query(sql).fetch_one(&self.store.pool()).await.expect(sql).get::<i64, _>(0)
    }

    pub async fn text(&self, sql: &str) -> Option<String> {
        sqlx::query(sql)
            .fetch_optional(&self.store.pool())
            .await
            .expect(sql)
            .and_then(|row| row.try_get::<Option<String>, _>(0).ok().flatten())
    }

    /// Ledger rows as `(change_type, change_data)`.
    pub async fn ledger(&self) -> Vec<(String, Value)> {
        let rows = sqlx::query("SELECT change_type, change_data FROM sync_table ORDER BY id")
            .fetch_all(&self.store.pool())
            .await
            .unwrap();
        rows.iter()
            .map(|row| {
                let data: String = row.get("change_data");
                (row.get("change_type"), serde_json::from_str(&data).unwrap())
            })
            .collect()
    }

    /// Append a ledger row as a route handler would.
    pub async fn push_change(&self, change_type: &str, data: Value) {
        sqlx::query("INSERT INTO sync_table (change_type, change_data) VALUES (?, ?)")
            .bind(change_type.to_string())
            .bind(data.to_string())
            .execute(&self.store.pool())
            .await
            .unwrap();
    }
}

pub fn read_json_file(path: &std::path::Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
