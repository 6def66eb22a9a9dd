//! SQLite implementation of [`Backend`].
//!
//! Storage layout is owned by [`SchemaManager`]; queries are translated by
//! [`Translator`] and facets counted by [`calculate_facet`]. Every mutating
//! call runs in one transaction, so an item's primary row and its auxiliary
//! rows are always written or removed together.
//!
//! Internally everything works with `anyhow::Result`; the conversion into
//! [`SearchError`] at the trait boundary keeps definition and query errors as
//! they are and turns SQL failures into transient backend errors.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use search_harness_core::backend::{Backend, BackendSettings};
use search_harness_core::error::{self as core_error, SearchError};
use search_harness_core::models::{IndexDef, IndexedItem, ItemId};
use search_harness_core::query::{
    Query, ResultItem, ResultSet, SortDirection, NO_VALID_KEYS_WARNING, RELEVANCE_FIELD,
};
use search_harness_core::schema::{IndexSchema, StorageKind};
use search_harness_core::text::{prepare_keys, word_scores};

use crate::facets::calculate_facet;
use crate::query_sql::{bind_values, Fragment, SqlValue, Translator};
use crate::schema::SchemaManager;

/// Ids per `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 200;

pub struct SqlBackend {
    pool: SqlitePool,
    schemas: SchemaManager,
    settings: BackendSettings,
}

impl SqlBackend {
    pub fn new(pool: SqlitePool, settings: BackendSettings) -> Self {
        Self {
            schemas: SchemaManager::new(pool.clone()),
            pool,
            settings,
        }
    }

    async fn require_schema(&self, index_id: &str) -> Result<IndexSchema> {
        match self.schemas.load(index_id).await? {
            Some(schema) => Ok(schema),
            None => Err(SearchError::Schema(format!(
                "index '{}' has no storage on this server",
                index_id
            ))
            .into()),
        }
    }

    async fn write_items(&self, index: &IndexDef, items: &[IndexedItem]) -> Result<Vec<ItemId>> {
        let schema = self.require_schema(&index.id).await?;
        let mut columns = Vec::new();
        let mut auxiliary = Vec::new();
        for field in &index.fields {
            match schema.field_tables.get(&field.name) {
                Some(table) if table.matches(field) => {
                    if table.is_auxiliary() {
                        auxiliary.push((field, table));
                    } else {
                        columns.push((field, table));
                    }
                }
                _ => warn!(
                    index = %index.id,
                    field = %field.name,
                    "field storage is out of date; values skipped until the index is updated"
                ),
            }
        }

        let insert_primary = format!(
            "INSERT INTO \"{}\" (item_id{}) VALUES (?{})",
            schema.index_table,
            columns
                .iter()
                .map(|(_, t)| format!(", \"{}\"", t.column))
                .collect::<String>(),
            ", ?".repeat(columns.len())
        );

        let mut tx = self.pool.begin().await?;
        for item in items {
            let id = item.id.to_string();
            for table in schema.all_tables() {
                sqlx::query(&format!("DELETE FROM \"{}\" WHERE item_id = ?", table))
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }

            let mut args = vec![SqlValue::Text(id.clone())];
            for (field, _) in &columns {
                args.push(
                    item.values_for(field)
                        .first()
                        .map(SqlValue::from)
                        .unwrap_or(SqlValue::Null),
                );
            }
            bind_values(sqlx::query(&insert_primary), &args)
                .execute(&mut *tx)
                .await?;

            for (field, table) in &auxiliary {
                let values = item.values_for(field);
                match table.storage {
                    StorageKind::Tokens => {
                        let texts: Vec<String> = values.iter().map(|v| v.filter_string()).collect();
                        let scores = word_scores(texts.iter().map(String::as_str), field.boost);
                        let sql = format!(
                            "INSERT INTO \"{}\" (item_id, word, score) VALUES (?, ?, ?)",
                            table.table
                        );
                        for (word, score) in scores {
                            sqlx::query(&sql)
                                .bind(&id)
                                .bind(word)
                                .bind(score)
                                .execute(&mut *tx)
                                .await?;
                        }
                    }
                    _ => {
                        let sql = format!(
                            "INSERT OR IGNORE INTO \"{}\" (item_id, value) VALUES (?, ?)",
                            table.table
                        );
                        for value in &values {
                            bind_values(
                                sqlx::query(&sql),
                                &[SqlValue::Text(id.clone()), SqlValue::from(value)],
                            )
                            .execute(&mut *tx)
                            .await?;
                        }
                    }
                }
            }
        }
        tx.commit().await?;

        debug!(index = %index.id, items = items.len(), "stored items");
        Ok(items.iter().map(|i| i.id.clone()).collect())
    }

    async fn delete_rows(&self, index: &IndexDef, ids: &[ItemId]) -> Result<()> {
        let Some(schema) = self.schemas.load(&index.id).await? else {
            return Ok(());
        };
        let ids: Vec<String> = ids.iter().map(ItemId::to_string).collect();
        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            for table in schema.all_tables() {
                let sql = format!("DELETE FROM \"{}\" WHERE item_id IN ({})", table, placeholders);
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(id);
                }
                query.execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn truncate(&self, index: &IndexDef) -> Result<()> {
        let Some(schema) = self.schemas.load(&index.id).await? else {
            return Ok(());
        };
        let mut tx = self.pool.begin().await?;
        for table in schema.all_tables() {
            sqlx::query(&format!("DELETE FROM \"{}\"", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(index = %index.id, "deleted all items");
        Ok(())
    }

    async fn list_ids(&self, index: &IndexDef) -> Result<Vec<ItemId>> {
        let Some(schema) = self.schemas.load(&index.id).await? else {
            return Ok(Vec::new());
        };
        let raw: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT item_id FROM \"{}\" ORDER BY item_id",
            schema.index_table
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut ids = Vec::with_capacity(raw.len());
        for id in raw {
            match id.parse::<ItemId>() {
                Ok(parsed) => ids.push(parsed),
                Err(e) => warn!(index = %index.id, item = %id, error = %e, "skipping malformed stored id"),
            }
        }
        Ok(ids)
    }

    async fn run_search(&self, index: &IndexDef, query: &Query) -> Result<ResultSet> {
        query.validate(index)?;
        let schema = self.require_schema(&index.id).await?;
        let partial = query.partial_matches.unwrap_or(self.settings.partial_matches);
        let translator = Translator::new(index, &schema, partial);
        let fields = query.searched_fields(index);

        let mut results = ResultSet::default();
        let keys = match &query.keys {
            Some(keys) => {
                let prepared = prepare_keys(keys, self.settings.min_chars);
                results.ignored_keys = prepared.ignored;
                if prepared.keys.is_none() {
                    results.warnings.push(NO_VALID_KEYS_WARNING.to_string());
                }
                prepared.keys
            }
            None => None,
        };

        let (keys_filter, score) = match &keys {
            Some(k) => (
                Some(translator.keys_filter(k, &fields)?),
                translator.keys_score(k, &fields)?,
            ),
            None => (None, Fragment::new("0")),
        };
        let mut parts: Vec<Fragment> = keys_filter.iter().cloned().collect();
        if let Some(conditions) = translator.conditions_filter(&query.conditions)? {
            parts.push(conditions);
        }
        let filter = Fragment::all(parts);

        let count_sql = format!(
            "SELECT COUNT(*) FROM \"{}\" t WHERE {}",
            schema.index_table, filter.sql
        );
        let row = bind_values(sqlx::query(&count_sql), &filter.args)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        results.result_count = count as usize;

        if query.limit != Some(0) && results.result_count > query.offset {
            let mut sorts = query.sorts.clone();
            if sorts.is_empty() && keys.is_some() {
                sorts.push((RELEVANCE_FIELD.to_string(), SortDirection::Desc));
            }
            let order = translator.order_by(&sorts)?;
            let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
            let items_sql = format!(
                "SELECT t.item_id AS item_id, CAST({} AS REAL) AS score FROM \"{}\" t WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
                score.sql, schema.index_table, filter.sql, order
            );
            debug!(index = %index.id, sql = %items_sql, "search query");

            let mut args = score.args.clone();
            args.extend(filter.args.iter().cloned());
            args.push(SqlValue::Integer(limit));
            args.push(SqlValue::Integer(query.offset as i64));
            let rows = bind_values(sqlx::query(&items_sql), &args)
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                let id: String = row.try_get("item_id")?;
                let score: f64 = row.try_get("score")?;
                results.items.push(ResultItem {
                    id: id.parse()?,
                    score,
                });
            }
        }

        for request in &query.facets {
            let buckets = calculate_facet(
                &self.pool,
                &translator,
                keys_filter.as_ref(),
                &query.conditions,
                request,
            )
            .await?;
            results.facets.insert(request.field.clone(), buckets);
        }

        Ok(results)
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn kind(&self) -> &str {
        "database"
    }

    async fn ping(&self) -> core_error::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SearchError::Backend(e.into()))?;
        Ok(())
    }

    async fn add_index(&self, index: &IndexDef) -> core_error::Result<()> {
        self.schemas.ensure_schema(index).await?;
        info!(index = %index.id, "created index storage");
        Ok(())
    }

    async fn update_index(&self, index: &IndexDef) -> core_error::Result<()> {
        self.schemas.ensure_schema(index).await?;
        info!(index = %index.id, "updated index storage");
        Ok(())
    }

    async fn remove_index(&self, index: &IndexDef) -> core_error::Result<()> {
        Ok(self.schemas.drop_schema(&index.id).await?)
    }

    async fn index_items(&self, index: &IndexDef, items: &[IndexedItem]) -> core_error::Result<Vec<ItemId>> {
        Ok(self.write_items(index, items).await?)
    }

    async fn delete_items(&self, index: &IndexDef, ids: &[ItemId]) -> core_error::Result<()> {
        Ok(self.delete_rows(index, ids).await?)
    }

    async fn delete_all_index_items(&self, index: &IndexDef) -> core_error::Result<()> {
        Ok(self.truncate(index).await?)
    }

    async fn stored_item_ids(&self, index: &IndexDef) -> core_error::Result<Vec<ItemId>> {
        Ok(self.list_ids(index).await?)
    }

    async fn search(&self, index: &IndexDef, query: &Query) -> core_error::Result<ResultSet> {
        Ok(self.run_search(index, query).await?)
    }

    async fn schema_map(&self, index_id: &str) -> core_error::Result<Option<IndexSchema>> {
        Ok(self.schemas.load(index_id).await?)
    }

    async fn uninstall(&self) -> core_error::Result<()> {
        for index_id in self.schemas.index_ids().await? {
            self.schemas.drop_schema(&index_id).await?;
        }
        Ok(())
    }
}
