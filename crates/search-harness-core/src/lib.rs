//! # Search Harness Core
//!
//! Storage-independent logic for Search Harness: index and item models,
//! the query model, tokenization, schema maps, the [`Backend`] trait, and an
//! in-memory backend.
//!
//! This crate contains no tokio runtime, sqlx, or filesystem I/O. The
//! relational backend, tracker, task queue, and CLI live in the
//! `search-harness` crate.
//!
//! [`Backend`]: backend::Backend

pub mod backend;
pub mod clock;
pub mod datasource;
pub mod error;
pub mod models;
pub mod query;
pub mod schema;
pub mod text;

pub use error::{Result, SearchError};
