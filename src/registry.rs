//! Applied index definitions.
//!
//! The registry remembers, per index, the definition that was last handed to
//! its server. Comparing the stored hash with the configured definition's
//! hash detects drift, which the engine resolves with `update_index` (or an
//! add/remove pair when the index moved to another server).

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;

use search_harness_core::clock::Clock;
use search_harness_core::models::IndexDef;

/// A stored registry record.
#[derive(Debug, Clone)]
pub struct RegisteredIndex {
    pub server_id: String,
    pub definition: IndexDef,
    pub definition_hash: String,
    pub updated_at: i64,
}

/// Hex SHA-256 of the canonical JSON of a definition.
pub fn definition_hash(index: &IndexDef) -> Result<String> {
    let json = serde_json::to_string(index)?;
    Ok(hex::encode(Sha256::digest(json.as_bytes())))
}

#[derive(Clone)]
pub struct IndexRegistry {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl IndexRegistry {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn get(&self, index_id: &str) -> Result<Option<RegisteredIndex>> {
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            "SELECT server_id, definition_json, definition_hash, updated_at FROM search_index_registry WHERE index_id = ?",
        )
        .bind(index_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(server_id, json, definition_hash, updated_at)| -> Result<RegisteredIndex> {
            Ok(RegisteredIndex {
                server_id,
                definition: serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt registry record for index '{}'", index_id))?,
                definition_hash,
                updated_at,
            })
        })
        .transpose()
    }

    pub async fn record(&self, index: &IndexDef) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO search_index_registry (index_id, server_id, definition_json, definition_hash, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(index_id) DO UPDATE SET
                server_id = excluded.server_id,
                definition_json = excluded.definition_json,
                definition_hash = excluded.definition_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&index.id)
        .bind(&index.server)
        .bind(serde_json::to_string(index)?)
        .bind(definition_hash(index)?)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn forget(&self, index_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM search_index_registry WHERE index_id = ?")
            .bind(index_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ids of every registered index.
    pub async fn index_ids(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT index_id FROM search_index_registry ORDER BY index_id")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_harness_core::models::{Field, FieldType};

    #[test]
    fn hash_tracks_definition_changes() {
        let a = IndexDef::new("c", "default", "d", vec![Field::new("body", FieldType::Text)]);
        let mut b = a.clone();
        assert_eq!(definition_hash(&a).unwrap(), definition_hash(&b).unwrap());
        b.fields[0].boost = 2.0;
        assert_ne!(definition_hash(&a).unwrap(), definition_hash(&b).unwrap());
        assert_eq!(definition_hash(&a).unwrap().len(), 64);
    }
}
