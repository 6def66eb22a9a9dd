//! Per-index item tracking.
//!
//! The tracker records, for every item a datasource knows about, whether the
//! copy in the backend is current (`indexed`) or must be (re)written
//! (`pending`). Indexing passes pull pending items in `changed` order and
//! mark them indexed once the backend has stored them. Deleted items leave
//! the tracker entirely, so `indexed <= total` always holds.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use search_harness_core::clock::Clock;
use search_harness_core::models::ItemId;

const STATUS_PENDING: i64 = 0;
const STATUS_INDEXED: i64 = 1;

/// Rows per multi-row statement.
const BATCH: usize = 200;

#[derive(Clone)]
pub struct Tracker {
    pool: SqlitePool,
    index_id: String,
    clock: Arc<dyn Clock>,
}

impl Tracker {
    pub fn new(pool: SqlitePool, index_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            index_id: index_id.into(),
            clock,
        }
    }

    pub fn index_id(&self) -> &str {
        &self.index_id
    }

    /// Start tracking items as pending. Already tracked items become pending
    /// again.
    pub async fn track_items_inserted(&self, ids: &[ItemId]) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                INSERT INTO search_tracker (index_id, item_id, status, changed)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(index_id, item_id) DO UPDATE SET
                    status = excluded.status,
                    changed = excluded.changed
                "#,
            )
            .bind(&self.index_id)
            .bind(id.to_string())
            .bind(STATUS_PENDING)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mark tracked items as pending. Unknown ids are ignored; returns the
    /// number of items marked.
    pub async fn track_items_updated(&self, ids: &[ItemId]) -> Result<u64> {
        let now = self.clock.now();
        let mut marked = 0;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let result = sqlx::query(
                "UPDATE search_tracker SET status = ?, changed = ? WHERE index_id = ? AND item_id = ?",
            )
            .bind(STATUS_PENDING)
            .bind(now)
            .bind(&self.index_id)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    /// Mark every tracked item as pending.
    pub async fn track_all_items_updated(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE search_tracker SET status = ?, changed = ? WHERE index_id = ?")
            .bind(STATUS_PENDING)
            .bind(self.clock.now())
            .bind(&self.index_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Mark items as indexed. Items that are no longer tracked stay untracked.
    pub async fn track_items_indexed(&self, ids: &[ItemId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE search_tracker SET status = ? WHERE index_id = ? AND item_id = ?")
                .bind(STATUS_INDEXED)
                .bind(&self.index_id)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Stop tracking items.
    pub async fn track_items_deleted(&self, ids: &[ItemId]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(ItemId::to_string).collect();
        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(BATCH) {
            let sql = format!(
                "DELETE FROM search_tracker WHERE index_id = ? AND item_id IN ({})",
                vec!["?"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql).bind(&self.index_id);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Pending items, oldest change first.
    pub async fn get_remaining_items(&self, limit: usize) -> Result<Vec<ItemId>> {
        let raw: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT item_id FROM search_tracker
            WHERE index_id = ? AND status = ?
            ORDER BY changed ASC, item_id ASC
            LIMIT ?
            "#,
        )
        .bind(&self.index_id)
        .bind(STATUS_PENDING)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        raw.iter()
            .map(|id| id.parse::<ItemId>().map_err(anyhow::Error::from))
            .collect()
    }

    pub async fn get_total_items_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_tracker WHERE index_id = ?")
            .bind(&self.index_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn get_indexed_items_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM search_tracker WHERE index_id = ? AND status = ?",
        )
        .bind(&self.index_id)
        .bind(STATUS_INDEXED)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Every tracked item, ordered by id.
    pub async fn all_item_ids(&self) -> Result<Vec<ItemId>> {
        let raw: Vec<String> = sqlx::query_scalar(
            "SELECT item_id FROM search_tracker WHERE index_id = ? ORDER BY item_id",
        )
        .bind(&self.index_id)
        .fetch_all(&self.pool)
        .await?;
        raw.iter()
            .map(|id| id.parse::<ItemId>().map_err(anyhow::Error::from))
            .collect()
    }

    /// Forget every item of the index.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM search_tracker WHERE index_id = ?")
            .bind(&self.index_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
