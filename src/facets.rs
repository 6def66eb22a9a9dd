//! Facet counting over the relational layout.
//!
//! A facet counts items, not rows: multi-valued fields count each item once
//! per distinct value. Counts are taken over the items matching the query's
//! keys and its conditions; OR facets first remove the condition groups
//! tagged with their own `facet:<field>` tag.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use search_harness_core::models::{FieldType, FieldValue};
use search_harness_core::query::{finalize_facet, ConditionGroup, FacetBucket, FacetRequest};

use crate::query_sql::{bind_values, Fragment, Translator};

/// Compute one facet.
///
/// `keys_filter` is the already translated fulltext restriction (if any);
/// `conditions` is the query's full condition tree.
pub async fn calculate_facet(
    pool: &SqlitePool,
    translator: &Translator<'_>,
    keys_filter: Option<&Fragment>,
    conditions: &ConditionGroup,
    request: &FacetRequest,
) -> Result<Vec<FacetBucket>> {
    let (field, table) = translator.field_table(&request.field)?;
    let effective = request.effective_conditions(conditions);

    let mut parts: Vec<Fragment> = keys_filter.into_iter().cloned().collect();
    if let Some(filter) = translator.conditions_filter(&effective)? {
        parts.push(filter);
    }
    let filter = Fragment::all(parts);
    let primary = translator.primary_table();

    let (values_sql, missing_sql) = if table.is_auxiliary() {
        (
            format!(
                "SELECT a.\"{col}\" AS value, COUNT(DISTINCT a.item_id) AS cnt FROM \"{aux}\" a \
                 WHERE a.item_id IN (SELECT t.item_id FROM \"{primary}\" t WHERE {filter}) \
                 GROUP BY a.\"{col}\"",
                col = table.column,
                aux = table.table,
                primary = primary,
                filter = filter.sql
            ),
            format!(
                "SELECT COUNT(*) FROM \"{primary}\" t WHERE {filter} \
                 AND t.item_id NOT IN (SELECT item_id FROM \"{aux}\")",
                primary = primary,
                filter = filter.sql,
                aux = table.table
            ),
        )
    } else {
        (
            format!(
                "SELECT t.\"{col}\" AS value, COUNT(*) AS cnt FROM \"{primary}\" t \
                 WHERE {filter} AND t.\"{col}\" IS NOT NULL GROUP BY t.\"{col}\"",
                col = table.column,
                primary = primary,
                filter = filter.sql
            ),
            format!(
                "SELECT COUNT(*) FROM \"{primary}\" t WHERE {filter} AND t.\"{col}\" IS NULL",
                primary = primary,
                filter = filter.sql,
                col = table.column
            ),
        )
    };
    debug!(facet = %request.field, sql = %values_sql, "facet query");

    let rows = bind_values(sqlx::query(&values_sql), &filter.args)
        .fetch_all(pool)
        .await?;
    let mut buckets = Vec::with_capacity(rows.len());
    for row in &rows {
        let count: i64 = row.try_get("cnt")?;
        let value = match field.field_type {
            FieldType::Integer => FieldValue::Integer(row.try_get("value")?),
            FieldType::Date => FieldValue::Date(row.try_get("value")?),
            FieldType::Boolean => {
                let raw: i64 = row.try_get("value")?;
                FieldValue::Boolean(raw != 0)
            }
            FieldType::Decimal => FieldValue::Decimal(row.try_get("value")?),
            FieldType::String | FieldType::Text => FieldValue::Text(row.try_get("value")?),
        };
        buckets.push(FacetBucket::value(&value, count as usize));
    }

    let missing = if request.missing {
        let row = bind_values(sqlx::query(&missing_sql), &filter.args)
            .fetch_one(pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        count as usize
    } else {
        0
    };

    Ok(finalize_facet(request, buckets, missing))
}
