//! Relational storage layout for indexes.
//!
//! [`SchemaManager`] turns an [`IndexDef`] into tables and keeps the
//! persisted [`IndexSchema`] in `search_index_schema` in step with them.
//!
//! # Layout
//!
//! ```text
//! search_<index>            item_id TEXT PRIMARY KEY, <single-valued columns>
//! search_<index>_<field>    item_id, value          (multi-valued fields)
//! search_<index>_<field>    item_id, word, score    (fulltext fields)
//! ```
//!
//! Every single-valued column and every `value`/`word` column carries a
//! secondary index. Names that collide with an existing table or column get
//! a numeric suffix; the chosen names are what the schema map records.
//!
//! All DDL for one call runs in a single transaction and uses
//! `IF [NOT] EXISTS` guards, so replaying a partially applied call is safe.

use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use search_harness_core::models::{Field, FieldType, IndexDef};
use search_harness_core::schema::{
    sanitize_identifier, FieldTable, IndexSchema, StorageKind, TABLE_PREFIX,
};
use search_harness_core::text::MAX_WORD_LENGTH;

/// Metadata tables that index tables must never be named after.
const RESERVED_TABLES: &[&str] = &[
    "search_index_schema",
    "search_index_registry",
    "search_tracker",
    "search_tasks",
    "search_task_claims",
];

/// SQL column type for a field's values.
pub fn column_type(field_type: FieldType, long: bool) -> &'static str {
    match field_type {
        FieldType::Integer | FieldType::Boolean | FieldType::Date => "INTEGER",
        FieldType::Decimal => "REAL",
        FieldType::String if long => "TEXT",
        FieldType::String => "VARCHAR(255)",
        FieldType::Text => "TEXT",
    }
}

fn index_name(table: &str, column: &str) -> String {
    format!("idx_{}_{}", table, column)
}

#[derive(Clone)]
pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The persisted schema map of an index, if it has storage.
    pub async fn load(&self, index_id: &str) -> Result<Option<IndexSchema>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT schema_json FROM search_index_schema WHERE index_id = ?")
                .bind(index_id)
                .fetch_optional(&self.pool)
                .await?;
        json.map(|j| {
            serde_json::from_str(&j)
                .with_context(|| format!("Corrupt schema map for index '{}'", index_id))
        })
        .transpose()
    }

    /// Ids of every index with a persisted schema map.
    pub async fn index_ids(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT index_id FROM search_index_schema ORDER BY index_id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Create or migrate storage so it matches `index`.
    ///
    /// Fields whose type, cardinality, or length class changed lose their
    /// storage and get it recreated empty. Removed fields are dropped.
    pub async fn ensure_schema(&self, index: &IndexDef) -> Result<IndexSchema> {
        index.validate()?;
        let existing = self.load(&index.id).await?;
        let mut taken = self.tables_owned_by_others(&index.id).await?;

        let mut tx = self.pool.begin().await?;

        let index_table = match &existing {
            Some(schema) => schema.index_table.clone(),
            None => unique_name(
                format!("{}{}", TABLE_PREFIX, sanitize_identifier(&index.id)),
                &taken,
            ),
        };
        taken.insert(index_table.clone());
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (item_id TEXT PRIMARY KEY)",
            index_table
        ))
        .execute(&mut *tx)
        .await?;

        let mut field_tables: BTreeMap<String, FieldTable> = BTreeMap::new();
        if let Some(schema) = existing {
            for (name, table) in schema.field_tables {
                match index.field(&name) {
                    Some(field) if table.matches(field) => {
                        field_tables.insert(name, table);
                    }
                    _ => {
                        info!(index = %index.id, field = %name, "dropping field storage");
                        drop_field_storage(&mut tx, &table).await?;
                    }
                }
            }
        }
        for table in field_tables.values() {
            taken.insert(table.table.clone());
        }

        let mut columns: HashSet<String> = field_tables
            .values()
            .filter(|t| !t.is_auxiliary())
            .map(|t| t.column.clone())
            .collect();
        columns.insert("item_id".to_string());

        for field in &index.fields {
            if field_tables.contains_key(&field.name) {
                continue;
            }
            let table = plan_field(&index_table, field, &mut taken, &mut columns);
            create_field_storage(&mut tx, &table).await?;
            debug!(index = %index.id, field = %field.name, table = %table.table, "created field storage");
            field_tables.insert(field.name.clone(), table);
        }

        let schema = IndexSchema {
            index_table,
            field_tables,
        };
        sqlx::query(
            r#"
            INSERT INTO search_index_schema (index_id, schema_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(index_id) DO UPDATE SET
                schema_json = excluded.schema_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&index.id)
        .bind(serde_json::to_string(&schema)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(schema)
    }

    /// Drop every table of an index and its schema map. No-op when the index
    /// has no storage.
    pub async fn drop_schema(&self, index_id: &str) -> Result<()> {
        let Some(schema) = self.load(index_id).await? else {
            return Ok(());
        };
        let mut tx = self.pool.begin().await?;
        for table in schema.all_tables() {
            sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM search_index_schema WHERE index_id = ?")
            .bind(index_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(index = %index_id, "dropped index storage");
        Ok(())
    }

    async fn tables_owned_by_others(&self, index_id: &str) -> Result<HashSet<String>> {
        let mut taken: HashSet<String> = RESERVED_TABLES.iter().map(|t| t.to_string()).collect();
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT index_id, schema_json FROM search_index_schema WHERE index_id <> ?",
        )
        .bind(index_id)
        .fetch_all(&self.pool)
        .await?;
        for (other, json) in rows {
            let schema: IndexSchema = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt schema map for index '{}'", other))?;
            taken.extend(schema.all_tables().into_iter().map(String::from));
        }
        Ok(taken)
    }
}

fn unique_name(base: String, taken: &HashSet<String>) -> String {
    if !taken.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn plan_field(
    index_table: &str,
    field: &Field,
    taken: &mut HashSet<String>,
    columns: &mut HashSet<String>,
) -> FieldTable {
    let storage = StorageKind::for_field(field);
    let name = sanitize_identifier(&field.name);
    let (table, column) = match storage {
        StorageKind::Column => {
            let column = unique_name(name, columns);
            columns.insert(column.clone());
            (index_table.to_string(), column)
        }
        StorageKind::Values => {
            let table = unique_name(format!("{}_{}", index_table, name), taken);
            taken.insert(table.clone());
            (table, "value".to_string())
        }
        StorageKind::Tokens => {
            let table = unique_name(format!("{}_{}", index_table, name), taken);
            taken.insert(table.clone());
            (table, "word".to_string())
        }
    };
    FieldTable {
        table,
        column,
        multi_valued: field.multi_valued,
        storage,
        field_type: field.field_type,
        long: field.is_long(),
    }
}

async fn column_exists(tx: &mut Transaction<'_, Sqlite>, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut **tx)
            .await?;
    Ok(count > 0)
}

async fn create_field_storage(tx: &mut Transaction<'_, Sqlite>, table: &FieldTable) -> Result<()> {
    let sql_type = column_type(table.field_type, table.long);
    match table.storage {
        StorageKind::Column => {
            if !column_exists(tx, &table.table, &table.column).await? {
                sqlx::query(&format!(
                    "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                    table.table, table.column, sql_type
                ))
                .execute(&mut **tx)
                .await?;
            }
        }
        StorageKind::Values => {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    item_id TEXT NOT NULL,
                    value {} NOT NULL,
                    PRIMARY KEY (item_id, value)
                )",
                table.table, sql_type
            ))
            .execute(&mut **tx)
            .await?;
        }
        StorageKind::Tokens => {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    item_id TEXT NOT NULL,
                    word VARCHAR({}) NOT NULL,
                    score REAL NOT NULL,
                    PRIMARY KEY (item_id, word)
                )",
                table.table, MAX_WORD_LENGTH
            ))
            .execute(&mut **tx)
            .await?;
        }
    }
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\"(\"{}\")",
        index_name(&table.table, &table.column),
        table.table,
        table.column
    ))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn drop_field_storage(tx: &mut Transaction<'_, Sqlite>, table: &FieldTable) -> Result<()> {
    if table.is_auxiliary() {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table.table))
            .execute(&mut **tx)
            .await?;
        return Ok(());
    }
    // The index must go first; SQLite refuses to drop an indexed column.
    sqlx::query(&format!(
        "DROP INDEX IF EXISTS \"{}\"",
        index_name(&table.table, &table.column)
    ))
    .execute(&mut **tx)
    .await?;
    if column_exists(tx, &table.table, &table.column).await? {
        sqlx::query(&format!(
            "ALTER TABLE \"{}\" DROP COLUMN \"{}\"",
            table.table, table.column
        ))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
