//! Durable queue of backend operations awaiting retry.
//!
//! When a mutating backend call fails transiently, or is refused because
//! earlier tasks are still pending, the operation is appended here and
//! replayed later by [`crate::server::SearchServer::execute_tasks`] in
//! append order. Each task stores a snapshot of the index definition it was
//! issued with; item-level tasks carry no item ids because replay relies on
//! the tracker instead.
//!
//! # Superseding
//!
//! A new task does not duplicate the most recent task for the same index
//! when they are compatible:
//!
//! | Latest pending | New | Result |
//! |----------------|-----|--------|
//! | `add_index` | `add_index` | payload replaced |
//! | `add_index` | `update_index` | `add_index` payload replaced |
//! | `update_index` | `update_index` | payload replaced |
//! | `X` | `X` (item-level, remove) | dropped as duplicate |
//! | anything else | | appended |

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use search_harness_core::clock::Clock;
use search_harness_core::models::IndexDef;

/// Backend operations that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    AddIndex,
    UpdateIndex,
    RemoveIndex,
    DeleteItems,
    DeleteAllItems,
    IndexItems,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::AddIndex => "add_index",
            TaskType::UpdateIndex => "update_index",
            TaskType::RemoveIndex => "remove_index",
            TaskType::DeleteItems => "delete_items",
            TaskType::DeleteAllItems => "delete_all_items",
            TaskType::IndexItems => "index_items",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "add_index" => TaskType::AddIndex,
            "update_index" => TaskType::UpdateIndex,
            "remove_index" => TaskType::RemoveIndex,
            "delete_items" => TaskType::DeleteItems,
            "delete_all_items" => TaskType::DeleteAllItems,
            "index_items" => TaskType::IndexItems,
            other => bail!("Unknown task type: '{}'", other),
        })
    }
}

/// A pending operation.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub server_id: String,
    pub index_id: String,
    pub task_type: TaskType,
    /// Index definition as it was when the operation was issued.
    pub index: IndexDef,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Record an operation, superseding a compatible latest task for the
    /// same index. Returns the id of the task that now represents it.
    pub async fn append(&self, server_id: &str, task_type: TaskType, index: &IndexDef) -> Result<i64> {
        let payload = serde_json::to_string(index)?;
        let mut tx = self.pool.begin().await?;

        let latest: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, task_type FROM search_tasks WHERE server_id = ? AND index_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(server_id)
        .bind(&index.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((latest_id, latest_type)) = latest {
            let latest_type: TaskType = latest_type.parse()?;
            let replace_payload = matches!(
                (latest_type, task_type),
                (TaskType::AddIndex, TaskType::AddIndex)
                    | (TaskType::AddIndex, TaskType::UpdateIndex)
                    | (TaskType::UpdateIndex, TaskType::UpdateIndex)
            );
            if replace_payload {
                sqlx::query("UPDATE search_tasks SET payload = ? WHERE id = ?")
                    .bind(&payload)
                    .bind(latest_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(latest_id);
            }
            if latest_type == task_type {
                tx.commit().await?;
                return Ok(latest_id);
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO search_tasks (server_id, index_id, task_type, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(server_id)
        .bind(&index.id)
        .bind(task_type.as_str())
        .bind(&payload)
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Pending tasks of a server in execution order.
    pub async fn pending(&self, server_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, server_id, index_id, task_type, payload, created_at
            FROM search_tasks WHERE server_id = ? ORDER BY id ASC
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Task> {
                let id: i64 = row.get("id");
                let task_type: String = row.get("task_type");
                let payload: String = row.get("payload");
                Ok(Task {
                    id,
                    server_id: row.get("server_id"),
                    index_id: row.get("index_id"),
                    task_type: task_type.parse()?,
                    index: serde_json::from_str(&payload)
                        .with_context(|| format!("Corrupt payload on task {}", id))?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    pub async fn pending_count(&self, server_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_tasks WHERE server_id = ?")
            .bind(server_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Delete every pending task of one index. Returns how many were removed.
    pub async fn cancel_for_index(&self, server_id: &str, index_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_tasks WHERE server_id = ? AND index_id = ?")
            .bind(server_id)
            .bind(index_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn remove(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM search_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every pending task of a server without executing it.
    pub async fn clear_server(&self, server_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_tasks WHERE server_id = ?")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Take the sweep claim of a server. Returns `None` while another live
    /// claim holds it; claims older than `lease_secs` are taken over.
    pub async fn claim(&self, server_id: &str, lease_secs: i64) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let held: Option<i64> =
            sqlx::query_scalar("SELECT claimed_at FROM search_task_claims WHERE server_id = ?")
                .bind(server_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(claimed_at) = held {
            if now - claimed_at < lease_secs {
                tx.commit().await?;
                return Ok(None);
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO search_task_claims (server_id, token, claimed_at) VALUES (?, ?, ?)
            ON CONFLICT(server_id) DO UPDATE SET token = excluded.token, claimed_at = excluded.claimed_at
            "#,
        )
        .bind(server_id)
        .bind(&token)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(token))
    }

    /// Release a claim taken with [`claim`](Self::claim). A claim that was
    /// taken over in the meantime is left alone.
    pub async fn release(&self, server_id: &str, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM search_task_claims WHERE server_id = ? AND token = ?")
            .bind(server_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
