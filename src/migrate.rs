//! Metadata tables and the uninstall path.
//!
//! Every table this crate creates starts with `search_`. Index storage tables
//! are created on demand by [`crate::schema::SchemaManager`]; the tables here
//! hold the shared metadata:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `search_index_schema` | Persisted schema map per index |
//! | `search_index_registry` | Last applied definition per index |
//! | `search_tracker` | Per-item indexing status |
//! | `search_tasks` | Pending backend operations |
//! | `search_task_claims` | Per-server sweep claims |

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the metadata tables on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_index_schema (
            index_id TEXT PRIMARY KEY,
            schema_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_index_registry (
            index_id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            definition_json TEXT NOT NULL,
            definition_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_tracker (
            index_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            changed INTEGER NOT NULL,
            PRIMARY KEY (index_id, item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id TEXT NOT NULL,
            index_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_task_claims (
            server_id TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            claimed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_tracker_pending ON search_tracker(index_id, status, changed)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_search_tasks_server ON search_tasks(server_id, id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Drop every `search_*` table, index storage and metadata alike.
///
/// Returns the names of the dropped tables.
pub async fn drop_all(pool: &SqlitePool) -> Result<Vec<String>> {
    let tables: Vec<String> = sqlx::query_scalar(
        r"SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'search\_%' ESCAPE '\' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    for table in &tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    info!(tables = tables.len(), "dropped search tables");
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent_and_uninstall_drops_everything() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        sqlx::query("CREATE TABLE unrelated (id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let dropped = drop_all(&pool).await.unwrap();
        assert!(dropped.contains(&"search_tasks".to_string()));
        assert_eq!(dropped.len(), 5);

        let left: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(left, vec!["unrelated".to_string()]);
    }
}
