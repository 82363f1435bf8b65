// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity registry: how a mirror file maps onto relational tables.
//!
//! Every entity has a mirror name (`products` → `products.json`,
//! `products.json.log`) and a table (`Products`). Some entities carry a
//! collection stored in a side table (product barcodes, user store
//! assignments), nested child rows (bill items) or a reference that must
//! exist before the row may be written (the user who created a bill).

use serde::Deserialize;

use crate::storage::traits::SyncError;

/// A mirror field holding a list of scalars kept in a two-column side table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SideCollection {
    pub table: String,
    pub owner_column: String,
    pub value_column: String,
    /// Array field on the mirror record
    pub field: String,
}

/// A mirror field holding nested objects stored as rows of a child table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChildRows {
    pub table: String,
    pub owner_column: String,
    pub field: String,
}

/// A mirror field that must name an existing row of another table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequiredReference {
    pub field: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntityDef {
    /// Mirror name, lowercase (`products`)
    pub name: String,
    /// Relational table (`Products`)
    pub table: String,
    #[serde(default)]
    pub side: Option<SideCollection>,
    #[serde(default)]
    pub children: Option<ChildRows>,
    #[serde(default)]
    pub requires: Option<RequiredReference>,
}

impl EntityDef {
    pub fn simple(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            side: None,
            children: None,
            requires: None,
        }
    }

    /// Mirror file name (`products.json`).
    pub fn mirror_file(&self) -> String {
        format!("{}.json", self.name)
    }

    /// Audit log file name (`products.json.log`).
    pub fn log_file(&self) -> String {
        format!("{}.json.log", self.name)
    }

    fn identifiers(&self) -> Vec<&str> {
        let mut ids = vec![self.table.as_str()];
        if let Some(side) = &self.side {
            ids.extend([side.table.as_str(), side.owner_column.as_str(), side.value_column.as_str()]);
        }
        if let Some(children) = &self.children {
            ids.extend([children.table.as_str(), children.owner_column.as_str()]);
        }
        if let Some(requires) = &self.requires {
            ids.push(requires.table.as_str());
        }
        ids
    }
}

/// Known entities, looked up by mirror name, table or log file name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct EntityRegistry {
    entities: Vec<EntityDef>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        let mut users = EntityDef::simple("users", "Users");
        users.side = Some(SideCollection {
            table: "UserStores".into(),
            owner_column: "userId".into(),
            value_column: "storeId".into(),
            field: "assignedStores".into(),
        });

        let mut products = EntityDef::simple("products", "Products");
        products.side = Some(SideCollection {
            table: "ProductBarcodes".into(),
            owner_column: "productId".into(),
            value_column: "barcode".into(),
            field: "barcodes".into(),
        });

        let mut bills = EntityDef::simple("bills", "Bills");
        bills.children = Some(ChildRows {
            table: "BillItems".into(),
            owner_column: "billId".into(),
            field: "items".into(),
        });
        bills.requires = Some(RequiredReference { field: "createdBy".into(), table: "Users".into() });

        Self::new(vec![
            users,
            products,
            bills,
            EntityDef::simple("stores", "Stores"),
            EntityDef::simple("customers", "Customers"),
        ])
    }
}

impl EntityRegistry {
    pub fn new(entities: Vec<EntityDef>) -> Self {
        Self { entities }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn by_table(&self, table: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.table.eq_ignore_ascii_case(table))
    }

    /// Entity for a ledger `table` value. Unregistered tables get a plain
    /// entity whose mirror is the lowercased table name.
    pub fn for_table(&self, table: &str) -> Result<EntityDef, SyncError> {
        if let Some(entity) = self.by_table(table) {
            return Ok(entity.clone());
        }
        if !is_safe_identifier(table) {
            return Err(SyncError::Parse(format!("unsafe table name '{}'", table)));
        }
        Ok(EntityDef::simple(&table.to_ascii_lowercase(), table))
    }

    /// Entity owning an audit log file (`products.json.log` → products).
    pub fn for_log_file(&self, file_name: &str) -> Option<&EntityDef> {
        crate::audit::entity_from_log_file(file_name).and_then(|name| self.by_name(name))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for entity in &self.entities {
            if entity.name.is_empty() || entity.name.contains(['/', '\\', '.']) {
                return Err(SyncError::Config(format!("invalid entity name '{}'", entity.name)));
            }
            if let Some(bad) = entity.identifiers().into_iter().find(|i| !is_safe_identifier(i)) {
                return Err(SyncError::Config(format!(
                    "entity '{}' has unsafe identifier '{}'",
                    entity.name, bad
                )));
            }
        }
        Ok(())
    }
}

/// Table and column names are spliced into SQL; only plain identifiers pass.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
