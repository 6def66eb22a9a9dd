//! A configured search server: a backend behind the task-queue fence.
//!
//! [`SearchServer`] is the only path through which backend mutations are
//! issued. Before every mutating call it checks the server's task queue:
//!
//! - pending tasks exist: the call is not executed. It is appended to the
//!   queue and [`SearchError::Fenced`] is returned. `remove_index` instead
//!   cancels every pending task of its index and queues itself.
//! - the call fails transiently: it is appended to the queue and
//!   [`SearchError::Queued`] is returned.
//!
//! Searches and other reads are never fenced. Every call, read or write,
//! first checks that the index belongs to this server.
//!
//! [`execute_tasks`](SearchServer::execute_tasks) replays the queue in order
//! and stops at the first failure.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use search_harness_core::backend::Backend;
use search_harness_core::clock::Clock;
use search_harness_core::error::{Result, SearchError};
use search_harness_core::models::{IndexDef, IndexedItem, ItemId};
use search_harness_core::query::{Query, ResultSet};
use search_harness_core::schema::IndexSchema;

use crate::tasks::{Task, TaskQueue, TaskType};
use crate::tracker::Tracker;

/// Outcome of one sweep over a server's queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub server: String,
    pub executed: usize,
    pub remaining: usize,
    /// Another sweep holds the claim; nothing was executed.
    pub skipped: bool,
    /// Error of the task that stopped the sweep.
    pub error: Option<String>,
}

pub struct SearchServer {
    id: String,
    backend: Arc<dyn Backend>,
    tasks: TaskQueue,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    claim_lease_secs: i64,
}

impl SearchServer {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn Backend>,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        claim_lease_secs: i64,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            tasks: TaskQueue::new(pool.clone(), clock.clone()),
            pool,
            clock,
            claim_lease_secs,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_kind(&self) -> &str {
        self.backend.kind()
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    fn guard(&self, index: &IndexDef) -> Result<()> {
        if index.server != self.id {
            return Err(SearchError::WrongServer {
                index: index.id.clone(),
                server: self.id.clone(),
            });
        }
        Ok(())
    }

    async fn queue(&self, task_type: TaskType, index: &IndexDef) -> Result<()> {
        self.tasks.append(&self.id, task_type, index).await?;
        Ok(())
    }

    /// Run `op` unless the queue is non-empty; queue it on transient failure.
    /// `op` is not polled when the call is fenced.
    async fn mutate<T, F>(&self, task_type: TaskType, index: &IndexDef, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard(index)?;
        let pending = self.tasks.pending_count(&self.id).await?;
        if pending > 0 {
            self.queue(task_type, index).await?;
            warn!(server = %self.id, index = %index.id, operation = %task_type, pending, "operation fenced by pending tasks");
            return Err(SearchError::Fenced {
                server: self.id.clone(),
                operation: task_type.to_string(),
                pending,
            });
        }
        match op.await {
            Err(e) if e.is_transient() => {
                self.queue(task_type, index).await?;
                warn!(server = %self.id, index = %index.id, operation = %task_type, error = %e, "operation failed; queued for retry");
                let cause = match e {
                    SearchError::Backend(cause) => cause,
                    other => anyhow::Error::new(other),
                };
                Err(SearchError::Queued {
                    server: self.id.clone(),
                    operation: task_type.to_string(),
                    cause,
                })
            }
            other => other,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    pub async fn add_index(&self, index: &IndexDef) -> Result<()> {
        index.validate()?;
        self.mutate(TaskType::AddIndex, index, self.backend.add_index(index))
            .await
    }

    pub async fn update_index(&self, index: &IndexDef) -> Result<()> {
        index.validate()?;
        self.mutate(TaskType::UpdateIndex, index, self.backend.update_index(index))
            .await
    }

    /// Remove an index. With tasks pending, every pending task of this index
    /// is cancelled and the removal becomes its only pending task.
    pub async fn remove_index(&self, index: &IndexDef) -> Result<()> {
        self.guard(index)?;
        if self.tasks.pending_count(&self.id).await? > 0 {
            let cancelled = self.tasks.cancel_for_index(&self.id, &index.id).await?;
            self.queue(TaskType::RemoveIndex, index).await?;
            let pending = self.tasks.pending_count(&self.id).await?;
            info!(server = %self.id, index = %index.id, cancelled, "removal queued behind pending tasks");
            return Err(SearchError::Fenced {
                server: self.id.clone(),
                operation: TaskType::RemoveIndex.to_string(),
                pending,
            });
        }
        self.mutate(TaskType::RemoveIndex, index, self.backend.remove_index(index))
            .await
    }

    pub async fn index_items(&self, index: &IndexDef, items: &[IndexedItem]) -> Result<Vec<ItemId>> {
        self.mutate(TaskType::IndexItems, index, self.backend.index_items(index, items))
            .await
    }

    pub async fn delete_items(&self, index: &IndexDef, ids: &[ItemId]) -> Result<()> {
        self.mutate(TaskType::DeleteItems, index, self.backend.delete_items(index, ids))
            .await
    }

    pub async fn delete_all_index_items(&self, index: &IndexDef) -> Result<()> {
        self.mutate(
            TaskType::DeleteAllItems,
            index,
            self.backend.delete_all_index_items(index),
        )
        .await
    }

    pub async fn search(&self, index: &IndexDef, query: &Query) -> Result<ResultSet> {
        self.guard(index)?;
        self.backend.search(index, query).await
    }

    pub async fn stored_item_ids(&self, index: &IndexDef) -> Result<Vec<ItemId>> {
        self.guard(index)?;
        self.backend.stored_item_ids(index).await
    }

    pub async fn schema_map(&self, index: &IndexDef) -> Result<Option<IndexSchema>> {
        self.guard(index)?;
        self.backend.schema_map(&index.id).await
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.backend.uninstall().await?;
        self.tasks.clear_server(&self.id).await?;
        Ok(())
    }

    async fn replay(&self, task: &Task) -> Result<()> {
        let index = &task.index;
        match task.task_type {
            TaskType::AddIndex => self.backend.add_index(index).await,
            TaskType::UpdateIndex => self.backend.update_index(index).await,
            TaskType::RemoveIndex => self.backend.remove_index(index).await,
            TaskType::DeleteAllItems => self.backend.delete_all_index_items(index).await,
            TaskType::DeleteItems => {
                // Delete whatever the tracker no longer knows about.
                let tracker = Tracker::new(self.pool.clone(), index.id.clone(), self.clock.clone());
                let known: HashSet<ItemId> = tracker.all_item_ids().await?.into_iter().collect();
                let stale: Vec<ItemId> = self
                    .backend
                    .stored_item_ids(index)
                    .await?
                    .into_iter()
                    .filter(|id| !known.contains(id))
                    .collect();
                self.backend.delete_items(index, &stale).await
            }
            // Items stay pending in the tracker; the next indexing pass writes
            // them once the backend is reachable.
            TaskType::IndexItems => self.backend.ping().await,
        }
    }

    /// Replay pending tasks in order. Stops at the first failure, leaving it
    /// and everything after it queued.
    pub async fn execute_tasks(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            server: self.id.clone(),
            ..SweepReport::default()
        };
        let Some(token) = self.tasks.claim(&self.id, self.claim_lease_secs).await? else {
            report.skipped = true;
            report.remaining = self.tasks.pending_count(&self.id).await?;
            return Ok(report);
        };

        let result = self.sweep(&mut report).await;
        self.tasks.release(&self.id, &token).await?;
        result?;

        report.remaining = self.tasks.pending_count(&self.id).await?;
        Ok(report)
    }

    async fn sweep(&self, report: &mut SweepReport) -> Result<()> {
        for task in self.tasks.pending(&self.id).await? {
            match self.replay(&task).await {
                Ok(()) => {
                    self.tasks.remove(task.id).await?;
                    report.executed += 1;
                    info!(server = %self.id, index = %task.index_id, operation = %task.task_type, "replayed task");
                }
                Err(e) => {
                    warn!(server = %self.id, index = %task.index_id, operation = %task.task_type, error = %e, "task failed; sweep stopped");
                    report.error = Some(format!("{} on index '{}': {}", task.task_type, task.index_id, e));
                    break;
                }
            }
        }
        Ok(())
    }
}
