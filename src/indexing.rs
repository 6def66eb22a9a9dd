//! Index orchestration: datasource → tracker → server.
//!
//! [`Engine`] owns the configured servers, datasources and indexes and runs
//! the flows that touch more than one of them:
//!
//! | Flow | Steps |
//! |------|-------|
//! | [`sync_index`](Engine::sync_index) | Compare the configured definition with the registry; add, update, or move the index |
//! | [`track_datasource`](Engine::track_datasource) | Track new datasource items, delete vanished ones |
//! | [`index_pending`](Engine::index_pending) | Extract pending items in batches and write them |
//! | [`reindex`](Engine::reindex) / [`clear`](Engine::clear) | Mark everything pending / empty the backend |
//! | [`execute_all_tasks`](Engine::execute_all_tasks) | Sweep every server's task queue |
//!
//! Backend calls go through [`SearchServer`], so a fenced or queued call
//! surfaces as [`SearchError::Fenced`] / [`SearchError::Queued`]. Flows that
//! can continue once the operation is recorded (definition changes, item
//! deletions) tolerate those and report them; indexing stops at the first
//! deferred batch and leaves the rest pending.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use search_harness_core::backend::memory::InMemoryBackend;
use search_harness_core::backend::Backend;
use search_harness_core::clock::{Clock, SystemClock};
use search_harness_core::datasource::Datasource;
use search_harness_core::error::{self as core_error, SearchError};
use search_harness_core::models::{IndexDef, IndexedItem, ItemId};
use search_harness_core::query::{Query, ResultSet};

use crate::config::{BackendKind, Config};
use crate::datasource_fs::FsDatasource;
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::registry::{definition_hash, IndexRegistry};
use crate::server::{SearchServer, SweepReport};
use crate::sql_backend::SqlBackend;
use crate::tracker::Tracker;
use crate::{db, migrate};

/// What [`Engine::sync_index`] did with an index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionChange {
    Unchanged,
    Added,
    Updated { reindex: bool },
    Moved { from: String },
    /// Registered but no longer configured; storage and tracking dropped.
    Removed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub index: String,
    pub change: DefinitionChange,
    /// Set when the backend call was queued instead of executed.
    pub deferred: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackReport {
    pub total: usize,
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    /// Pending items whose source no longer exists.
    pub removed: usize,
    pub remaining: u64,
    /// Set when a batch was fenced or queued; indexing stopped there.
    pub deferred: Option<String>,
}

/// Turn a fenced or queued outcome into `Some(message)`, pass other errors on.
fn tolerate_deferred(result: core_error::Result<()>) -> Result<Option<String>> {
    match result {
        Ok(()) => Ok(None),
        Err(e) if e.is_deferred() => {
            warn!(error = %e, "operation deferred");
            Ok(Some(e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub struct Engine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    registry: IndexRegistry,
    claim_lease_secs: i64,
    servers: BTreeMap<String, SearchServer>,
    datasources: BTreeMap<String, Arc<dyn Datasource>>,
    indexes: BTreeMap<String, IndexDef>,
}

impl Engine {
    /// An engine without servers, datasources or indexes. The metadata
    /// tables must already exist on `pool`.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, claim_lease_secs: i64) -> Self {
        Self {
            registry: IndexRegistry::new(pool.clone(), clock.clone()),
            pool,
            clock,
            claim_lease_secs,
            servers: BTreeMap::new(),
            datasources: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    /// Connect to the configured database, run migrations, and build every
    /// configured server, datasource and index.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let mut engine = Engine::new(pool.clone(), Arc::new(SystemClock), config.tasks.claim_lease_secs);

        for (id, server) in &config.servers {
            let backend: Arc<dyn Backend> = match server.backend {
                BackendKind::Database => Arc::new(SqlBackend::new(pool.clone(), server.settings)),
                BackendKind::Memory => Arc::new(InMemoryBackend::new(server.settings)),
            };
            engine.add_server(id, backend);
        }
        for (id, ds) in &config.datasources {
            let datasource = FsDatasource::from_config(id, ds)
                .with_context(|| format!("Invalid datasource '{}'", id))?;
            engine.add_datasource(Arc::new(datasource));
        }
        for index in config.index_defs()? {
            engine.add_index(index)?;
        }
        engine.restore_missing_storage().await?;
        Ok(engine)
    }

    pub fn add_server(&mut self, id: &str, backend: Arc<dyn Backend>) {
        let server = SearchServer::new(
            id,
            backend,
            self.pool.clone(),
            self.clock.clone(),
            self.claim_lease_secs,
        );
        self.servers.insert(id.to_string(), server);
    }

    pub fn add_datasource(&mut self, datasource: Arc<dyn Datasource>) {
        self.datasources.insert(datasource.id().to_string(), datasource);
    }

    /// Register a definition. Storage is created by [`sync_index`](Self::sync_index).
    pub fn add_index(&mut self, index: IndexDef) -> Result<()> {
        if !self.servers.contains_key(&index.server) {
            anyhow::bail!("Index '{}' refers to unknown server '{}'", index.id, index.server);
        }
        if !self.datasources.contains_key(&index.datasource) {
            anyhow::bail!(
                "Index '{}' refers to unknown datasource '{}'",
                index.id,
                index.datasource
            );
        }
        self.indexes.insert(index.id.clone(), index);
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self, id: &str) -> Result<&IndexDef> {
        self.indexes
            .get(id)
            .with_context(|| format!("Unknown index: '{}'", id))
    }

    pub fn indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.values()
    }

    pub fn server(&self, id: &str) -> Result<&SearchServer> {
        self.servers
            .get(id)
            .with_context(|| format!("Unknown server: '{}'", id))
    }

    pub fn servers(&self) -> impl Iterator<Item = &SearchServer> {
        self.servers.values()
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    fn server_for(&self, index: &IndexDef) -> Result<&SearchServer> {
        self.server(&index.server)
    }

    fn datasource_for(&self, index: &IndexDef) -> Result<&Arc<dyn Datasource>> {
        self.datasources
            .get(&index.datasource)
            .with_context(|| format!("Unknown datasource: '{}'", index.datasource))
    }

    pub fn tracker(&self, index_id: &str) -> Tracker {
        Tracker::new(self.pool.clone(), index_id, self.clock.clone())
    }

    /// Bring an index's storage in line with its configured definition.
    pub async fn sync_index(&self, index_id: &str) -> Result<SyncOutcome> {
        let index = self.index(index_id)?;
        let server = self.server_for(index)?;
        let tracker = self.tracker(index_id);

        let (change, deferred) = match self.registry.get(index_id).await? {
            None => {
                let deferred = tolerate_deferred(server.add_index(index).await)?;
                (DefinitionChange::Added, deferred)
            }
            Some(previous) if previous.server_id != index.server => {
                let mut deferred = None;
                match self.servers.get(&previous.server_id) {
                    Some(old) => deferred = tolerate_deferred(old.remove_index(&previous.definition).await)?,
                    None => warn!(
                        index = %index_id,
                        server = %previous.server_id,
                        "previous server is no longer configured; its storage is left in place"
                    ),
                }
                if let Some(added) = tolerate_deferred(server.add_index(index).await)? {
                    deferred = Some(added);
                }
                tracker.track_all_items_updated().await?;
                (
                    DefinitionChange::Moved {
                        from: previous.server_id,
                    },
                    deferred,
                )
            }
            Some(previous) if previous.definition_hash != definition_hash(index)? => {
                let deferred = tolerate_deferred(server.update_index(index).await)?;
                let reindex = index.needs_reindex_from(&previous.definition);
                if reindex {
                    tracker.track_all_items_updated().await?;
                }
                (DefinitionChange::Updated { reindex }, deferred)
            }
            Some(_) => (DefinitionChange::Unchanged, None),
        };

        if change != DefinitionChange::Unchanged {
            self.registry.record(index).await?;
            info!(index = %index_id, change = ?change, "index definition applied");
        }
        Ok(SyncOutcome {
            index: index_id.to_string(),
            change,
            deferred,
        })
    }

    /// Recreate storage for registered indexes that their server no longer
    /// holds, and mark all of their items pending. A `memory` server starts
    /// empty in every process, so its indexes come back here.
    ///
    /// Indexes with pending tasks are left to the task queue.
    pub async fn restore_missing_storage(&self) -> Result<Vec<String>> {
        let mut restored = Vec::new();
        for index_id in self.registry.index_ids().await? {
            let Some(record) = self.registry.get(&index_id).await? else {
                continue;
            };
            let Some(server) = self.servers.get(&record.server_id) else {
                continue;
            };
            if server.schema_map(&record.definition).await?.is_some() {
                continue;
            }
            let queued = server.tasks().pending(server.id()).await?;
            if queued.iter().any(|task| task.index_id == index_id) {
                continue;
            }
            tolerate_deferred(server.add_index(&record.definition).await)?;
            let marked = self.tracker(&index_id).track_all_items_updated().await?;
            info!(index = %index_id, server = %record.server_id, items = marked, "restored missing index storage");
            restored.push(index_id);
        }
        Ok(restored)
    }

    /// Remove indexes that are registered but no longer configured.
    pub async fn prune_removed_indexes(&self) -> Result<Vec<SyncOutcome>> {
        let mut removed = Vec::new();
        for index_id in self.registry.index_ids().await? {
            if self.indexes.contains_key(&index_id) {
                continue;
            }
            let Some(record) = self.registry.get(&index_id).await? else {
                continue;
            };
            let deferred = match self.servers.get(&record.server_id) {
                Some(server) => tolerate_deferred(server.remove_index(&record.definition).await)?,
                None => None,
            };
            self.tracker(&index_id).clear().await?;
            self.registry.forget(&index_id).await?;
            info!(index = %index_id, "removed index no longer in configuration");
            removed.push(SyncOutcome {
                index: index_id,
                change: DefinitionChange::Removed,
                deferred,
            });
        }
        Ok(removed)
    }

    /// Track items the datasource added and delete the ones it dropped.
    pub async fn track_datasource(
        &self,
        index_id: &str,
        progress: &dyn IndexProgressReporter,
    ) -> Result<TrackReport> {
        let index = self.index(index_id)?;
        let datasource = self.datasource_for(index)?;
        let tracker = self.tracker(index_id);

        progress.report(IndexProgressEvent::Tracking {
            index: index_id.to_string(),
        });
        let current = datasource.item_ids().await?;
        let current_set: HashSet<&ItemId> = current.iter().collect();
        let known: HashSet<ItemId> = tracker.all_item_ids().await?.into_iter().collect();

        let added: Vec<ItemId> = current.iter().filter(|id| !known.contains(*id)).cloned().collect();
        let removed: Vec<ItemId> = known
            .iter()
            .filter(|id| !current_set.contains(id))
            .cloned()
            .collect();

        if !added.is_empty() {
            tracker.track_items_inserted(&added).await?;
        }
        if !removed.is_empty() {
            self.items_deleted(index_id, &removed).await?;
        }
        Ok(TrackReport {
            total: current.len(),
            added: added.len(),
            removed: removed.len(),
        })
    }

    /// Mark items as changed. Returns how many tracked items were marked.
    pub async fn items_changed(&self, index_id: &str, ids: &[ItemId]) -> Result<u64> {
        self.index(index_id)?;
        self.tracker(index_id).track_items_updated(ids).await
    }

    /// Stop tracking items and delete them from the backend.
    ///
    /// The tracker is updated first: a queued deletion is replayed as "delete
    /// every stored item the tracker does not know", which then covers these.
    pub async fn items_deleted(&self, index_id: &str, ids: &[ItemId]) -> Result<Option<String>> {
        let index = self.index(index_id)?;
        self.tracker(index_id).track_items_deleted(ids).await?;
        let server = self.server_for(index)?;
        tolerate_deferred(server.delete_items(index, ids).await)
    }

    /// Index pending items in batches of the index's `cron_limit`, up to
    /// `limit` items in total.
    pub async fn index_pending(
        &self,
        index_id: &str,
        limit: Option<usize>,
        progress: &dyn IndexProgressReporter,
    ) -> Result<IndexReport> {
        let index = self.index(index_id)?;
        let server = self.server_for(index)?;
        let datasource = self.datasource_for(index)?;
        let tracker = self.tracker(index_id);

        let total_pending = tracker.get_total_items_count().await? - tracker.get_indexed_items_count().await?;
        let mut report = IndexReport::default();
        let mut budget = limit.unwrap_or(usize::MAX);
        let mut processed: u64 = 0;
        // Items the backend declined this pass; they stay pending for the next one.
        let mut declined: HashSet<ItemId> = HashSet::new();

        while budget > 0 {
            let batch = index.options.cron_limit.min(budget);
            let ids: Vec<ItemId> = tracker
                .get_remaining_items(batch.saturating_add(declined.len()))
                .await?
                .into_iter()
                .filter(|id| !declined.contains(id))
                .take(batch)
                .collect();
            if ids.is_empty() {
                break;
            }
            budget = budget.saturating_sub(ids.len());
            processed += ids.len() as u64;

            let mut items = Vec::with_capacity(ids.len());
            let mut gone = Vec::new();
            for id in ids {
                let values = datasource
                    .extract_field_values(&id, &index.fields)
                    .await
                    .with_context(|| format!("Failed to extract values for item '{}'", id))?;
                match values {
                    Some(values) => items.push(IndexedItem::new(id, values)),
                    None => gone.push(id),
                }
            }

            if !gone.is_empty() {
                report.removed += gone.len();
                if let Some(deferred) = self.items_deleted(index_id, &gone).await? {
                    report.deferred = Some(deferred);
                    break;
                }
            }

            if !items.is_empty() {
                let outcome = server.index_items(index, &items).await;
                match outcome {
                    Ok(stored) => {
                        tracker.track_items_indexed(&stored).await?;
                        report.indexed += stored.len();
                        if stored.len() < items.len() {
                            let stored: HashSet<&ItemId> = stored.iter().collect();
                            let skipped: Vec<ItemId> = items
                                .into_iter()
                                .map(|item| item.id)
                                .filter(|id| !stored.contains(id))
                                .collect();
                            warn!(index = %index_id, count = skipped.len(), "backend did not store every item");
                            declined.extend(skipped);
                        }
                    }
                    Err(e) if e.is_deferred() => {
                        warn!(index = %index_id, error = %e, "indexing deferred");
                        report.deferred = Some(e.to_string());
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            progress.report(IndexProgressEvent::Indexing {
                index: index_id.to_string(),
                n: processed,
                total: total_pending,
            });
        }

        report.remaining =
            tracker.get_total_items_count().await? - tracker.get_indexed_items_count().await?;
        info!(index = %index_id, indexed = report.indexed, remaining = report.remaining, "indexing pass finished");
        Ok(report)
    }

    /// Mark every tracked item for reindexing. Stored data stays searchable
    /// until it is overwritten.
    pub async fn reindex(&self, index_id: &str) -> Result<u64> {
        self.index(index_id)?;
        self.tracker(index_id).track_all_items_updated().await
    }

    /// Delete every stored item and mark all tracked items pending.
    pub async fn clear(&self, index_id: &str) -> Result<Option<String>> {
        let index = self.index(index_id)?;
        let server = self.server_for(index)?;
        let deferred = tolerate_deferred(server.delete_all_index_items(index).await)?;
        self.tracker(index_id).track_all_items_updated().await?;
        Ok(deferred)
    }

    pub async fn search(&self, index_id: &str, query: &Query) -> core_error::Result<ResultSet> {
        let index = self.index(index_id).map_err(|e| SearchError::Config(e.to_string()))?;
        let server = self
            .server_for(index)
            .map_err(|e| SearchError::Config(e.to_string()))?;
        server.search(index, query).await
    }

    /// Sweep the task queue of every server.
    pub async fn execute_all_tasks(&self) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::with_capacity(self.servers.len());
        for server in self.servers.values() {
            reports.push(server.execute_tasks().await?);
        }
        Ok(reports)
    }

    /// Drop all backend storage and every `search_*` table.
    pub async fn uninstall(&self) -> Result<Vec<String>> {
        for server in self.servers.values() {
            server
                .uninstall()
                .await
                .with_context(|| format!("Failed to uninstall server '{}'", server.id()))?;
        }
        migrate::drop_all(&self.pool).await
    }
}
