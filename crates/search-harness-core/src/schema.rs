//! Persisted schema map: how an index's fields are laid out in storage.
//!
//! Each index gets one primary table holding single-valued fields as
//! columns. Multi-valued fields get an auxiliary `(item_id, value)` table and
//! fulltext fields an auxiliary `(item_id, word, score)` table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Field, FieldType, IndexDef};

/// Prefix of every table owned by a relational backend.
pub const TABLE_PREFIX: &str = "search_";

/// Where a field's values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A column of the primary table.
    Column,
    /// An auxiliary `(item_id, value)` table.
    Values,
    /// An auxiliary `(item_id, word, score)` token table.
    Tokens,
}

impl StorageKind {
    pub fn for_field(field: &Field) -> StorageKind {
        if field.field_type.is_fulltext() {
            StorageKind::Tokens
        } else if field.multi_valued {
            StorageKind::Values
        } else {
            StorageKind::Column
        }
    }
}

/// Storage location of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTable {
    pub table: String,
    pub column: String,
    pub multi_valued: bool,
    pub storage: StorageKind,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub long: bool,
}

impl FieldTable {
    pub fn is_auxiliary(&self) -> bool {
        self.storage != StorageKind::Column
    }

    /// Whether this entry still matches the field's declared storage needs.
    pub fn matches(&self, field: &Field) -> bool {
        self.field_type == field.field_type
            && self.multi_valued == field.multi_valued
            && self.long == field.is_long()
    }
}

/// Storage layout of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub index_table: String,
    pub field_tables: BTreeMap<String, FieldTable>,
}

impl IndexSchema {
    /// Auxiliary tables, in field order.
    pub fn auxiliary_tables(&self) -> Vec<&str> {
        self.field_tables
            .values()
            .filter(|t| t.is_auxiliary())
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Every table owned by the index, primary table last.
    pub fn all_tables(&self) -> Vec<&str> {
        let mut tables = self.auxiliary_tables();
        tables.push(self.index_table.as_str());
        tables
    }

    /// Layout derived from the definition alone, without collision checks
    /// against existing storage.
    pub fn plan(index: &IndexDef) -> IndexSchema {
        let index_table = format!("{}{}", TABLE_PREFIX, sanitize_identifier(&index.id));
        let field_tables = index
            .fields
            .iter()
            .map(|field| {
                let storage = StorageKind::for_field(field);
                let name = sanitize_identifier(&field.name);
                let (table, column) = match storage {
                    StorageKind::Column => (index_table.clone(), name),
                    StorageKind::Values => (format!("{}_{}", index_table, name), "value".to_string()),
                    StorageKind::Tokens => (format!("{}_{}", index_table, name), "word".to_string()),
                };
                (
                    field.name.clone(),
                    FieldTable {
                        table,
                        column,
                        multi_valued: field.multi_valued,
                        storage,
                        field_type: field.field_type,
                        long: field.is_long(),
                    },
                )
            })
            .collect();
        IndexSchema {
            index_table,
            field_tables,
        }
    }
}

/// Lowercase and replace anything outside `[a-z0-9_]` with `_`.
pub fn sanitize_identifier(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
