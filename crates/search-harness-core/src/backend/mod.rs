//! Storage backend abstraction.
//!
//! The [`Backend`] trait is the pluggable unit that stores index data and
//! answers queries for one storage technology. The relational (SQLite)
//! implementation lives in the `search-harness` crate; [`memory`] provides an
//! in-memory implementation used by tests and by `memory` servers.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Error contract
//!
//! Definition problems are reported as [`SearchError::Schema`] and query
//! problems as [`SearchError::InvalidQuery`] /
//! [`SearchError::UnknownField`]. Storage failures are
//! [`SearchError::Backend`]; only those are retried through the task queue.
//!
//! [`SearchError::Schema`]: crate::error::SearchError::Schema
//! [`SearchError::InvalidQuery`]: crate::error::SearchError::InvalidQuery
//! [`SearchError::UnknownField`]: crate::error::SearchError::UnknownField
//! [`SearchError::Backend`]: crate::error::SearchError::Backend

pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::models::{IndexDef, IndexedItem, ItemId};
use crate::query::{Query, ResultSet};
use crate::schema::IndexSchema;

/// Tokenizer and matching settings of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackendSettings {
    /// Keywords shorter than this are ignored.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    /// Match keywords as substrings of stored words.
    #[serde(default)]
    pub partial_matches: bool,
}

fn default_min_chars() -> usize {
    1
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            min_chars: 1,
            partial_matches: false,
        }
    }
}

/// Abstract search backend.
///
/// # Operations
///
/// | Method | Mutating | Purpose |
/// |--------|----------|---------|
/// | [`ping`](Backend::ping) | no | Check storage is reachable |
/// | [`add_index`](Backend::add_index) | yes | Create storage for an index |
/// | [`update_index`](Backend::update_index) | yes | Migrate storage to a changed definition |
/// | [`remove_index`](Backend::remove_index) | yes | Drop all storage of an index |
/// | [`index_items`](Backend::index_items) | yes | Upsert items |
/// | [`delete_items`](Backend::delete_items) | yes | Delete items |
/// | [`delete_all_index_items`](Backend::delete_all_index_items) | yes | Empty an index |
/// | [`stored_item_ids`](Backend::stored_item_ids) | no | List stored items |
/// | [`search`](Backend::search) | no | Run a query |
/// | [`schema_map`](Backend::schema_map) | no | Introspect storage layout |
/// | [`uninstall`](Backend::uninstall) | yes | Drop everything the backend owns |
///
/// Every mutating operation must be idempotent: replaying it after a
/// partially applied attempt leaves storage in the same state as one
/// successful call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend identifier (`"database"`, `"memory"`).
    fn kind(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    async fn add_index(&self, index: &IndexDef) -> Result<()>;

    async fn update_index(&self, index: &IndexDef) -> Result<()>;

    async fn remove_index(&self, index: &IndexDef) -> Result<()>;

    /// Upsert items, returning the ids that were stored.
    async fn index_items(&self, index: &IndexDef, items: &[IndexedItem]) -> Result<Vec<ItemId>>;

    async fn delete_items(&self, index: &IndexDef, ids: &[ItemId]) -> Result<()>;

    async fn delete_all_index_items(&self, index: &IndexDef) -> Result<()>;

    async fn stored_item_ids(&self, index: &IndexDef) -> Result<Vec<ItemId>>;

    async fn search(&self, index: &IndexDef, query: &Query) -> Result<ResultSet>;

    async fn schema_map(&self, index_id: &str) -> Result<Option<IndexSchema>>;

    async fn uninstall(&self) -> Result<()>;
}
