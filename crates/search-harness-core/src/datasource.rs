//! Item providers.
//!
//! A [`Datasource`] enumerates the items of one source and extracts field
//! values for them. The engine tracks ids returned by
//! [`item_ids`](Datasource::item_ids) and asks for values only when an item
//! is due for indexing.

use async_trait::async_trait;

use crate::models::{Field, ItemId, ItemValues};

#[async_trait]
pub trait Datasource: Send + Sync {
    /// Datasource id; the first component of every [`ItemId`] it returns.
    fn id(&self) -> &str;

    /// Every item currently available.
    async fn item_ids(&self) -> anyhow::Result<Vec<ItemId>>;

    /// Values for `fields`, or `None` when the item no longer exists.
    async fn extract_field_values(
        &self,
        id: &ItemId,
        fields: &[Field],
    ) -> anyhow::Result<Option<ItemValues>>;
}
