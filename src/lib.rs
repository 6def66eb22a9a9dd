//! # Search Harness
//!
//! A pluggable search indexing and query engine backed by SQLite.
//!
//! Index definitions (typed fields, a server, a datasource) are declared in
//! TOML. Items are read from datasources, tracked per index, and written to
//! a search server's backend, which answers fulltext, filtered, sorted and
//! faceted queries. Backend mutations run behind a durable task queue: a call
//! that fails transiently, or is issued while earlier tasks are unresolved,
//! is recorded and replayed in order by the task sweep.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────────┐   ┌────────────┐
//! │ Datasources │──▶│ Tracker  │──▶│ SearchServer │──▶│  Backend   │
//! │ (JSON files)│   │ (pending)│   │ (task fence) │   │ SQL/memory │
//! └─────────────┘   └──────────┘   └──────┬───────┘   └────────────┘
//!                                         │
//!                                   ┌─────▼─────┐
//!                                   │ Task queue│
//!                                   └───────────┘
//! ```
//!
//! The backend trait, query model and in-memory backend live in
//! `search-harness-core`; this crate adds the SQLite backend, the metadata
//! tables and the `sidx` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Metadata tables |
//! | [`schema`] | Per-index table layout |
//! | [`query_sql`] | Query → SQL translation |
//! | [`facets`] | Facet counts in SQL |
//! | [`sql_backend`] | SQLite [`Backend`](search_harness_core::backend::Backend) |
//! | [`tracker`] | Per-index item tracking |
//! | [`tasks`] | Durable task queue |
//! | [`server`] | Task-fenced backend access |
//! | [`registry`] | Applied index definitions |
//! | [`datasource_fs`] | JSON file datasource |
//! | [`indexing`] | Orchestration engine |
//! | [`progress`] | Progress reporting |
//! | [`status`] | Status overview |
//! | [`commands`] | CLI commands |

pub mod commands;
pub mod config;
pub mod datasource_fs;
pub mod db;
pub mod facets;
pub mod indexing;
pub mod migrate;
pub mod progress;
pub mod query_sql;
pub mod registry;
pub mod schema;
pub mod server;
pub mod sql_backend;
pub mod status;
pub mod tasks;
pub mod tracker;
