//! In-memory [`Backend`] implementation for tests and ephemeral servers.
//!
//! Uses `HashMap` and `BTreeMap` behind `std::sync::RwLock`. Queries are
//! evaluated by scanning every stored item, with the same semantics as the
//! relational backend: multi-valued conditions test "any value" (negative
//! operators "no value"), OR facets ignore their own `facet:<field>`
//! filters, and items without a sort value sort last ascending.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{Result, SearchError};
use crate::models::{Field, FieldValue, IndexDef, IndexedItem, ItemId};
use crate::query::{
    finalize_facet, Condition, ConditionGroup, ConditionNode, ConditionValue, Conjunction,
    FacetBucket, FacetRequest, Keys, Operator, Query, ResultItem, ResultSet, SortDirection,
    ID_FIELD, NO_VALID_KEYS_WARNING, RELEVANCE_FIELD,
};
use crate::schema::IndexSchema;
use crate::text::{normalize, prepare_keys, word_scores};

use super::{Backend, BackendSettings};

struct StoredItem {
    id: ItemId,
    values: BTreeMap<String, Vec<FieldValue>>,
    words: BTreeMap<String, BTreeMap<String, f64>>,
}

struct StoredIndex {
    def: IndexDef,
    items: BTreeMap<String, StoredItem>,
}

/// In-memory backend.
pub struct InMemoryBackend {
    settings: BackendSettings,
    indexes: RwLock<HashMap<String, StoredIndex>>,
}

impl InMemoryBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredIndex>>> {
        self.indexes
            .read()
            .map_err(|_| SearchError::backend("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredIndex>>> {
        self.indexes
            .write()
            .map_err(|_| SearchError::backend("in-memory index lock poisoned"))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(BackendSettings::default())
    }
}

fn missing_index(index_id: &str) -> SearchError {
    SearchError::Schema(format!("index '{}' has no storage on this server", index_id))
}

fn store_item(def: &IndexDef, item: &IndexedItem) -> StoredItem {
    let mut values = BTreeMap::new();
    let mut words = BTreeMap::new();
    for field in &def.fields {
        let field_values = item.values_for(field);
        if field.field_type.is_fulltext() {
            let texts: Vec<String> = field_values.iter().map(|v| v.filter_string()).collect();
            let scores = word_scores(texts.iter().map(String::as_str), field.boost);
            if !scores.is_empty() {
                words.insert(field.name.clone(), scores);
            }
        } else if !field_values.is_empty() {
            values.insert(field.name.clone(), field_values);
        }
    }
    StoredItem {
        id: item.id.clone(),
        values,
        words,
    }
}

fn field_values(item: &StoredItem, field: &Field) -> Vec<FieldValue> {
    if field.field_type.is_fulltext() {
        item.words
            .get(&field.name)
            .map(|w| w.keys().cloned().map(FieldValue::Text).collect())
            .unwrap_or_default()
    } else {
        item.values.get(&field.name).cloned().unwrap_or_default()
    }
}

fn condition_operand(field: &Field, value: &FieldValue) -> FieldValue {
    match value {
        FieldValue::Text(s) if field.field_type.is_fulltext() => FieldValue::Text(normalize(s)),
        other => other.clone(),
    }
}

fn value_matches(field: &Field, stored: &FieldValue, operator: Operator, value: &ConditionValue) -> bool {
    let cmp = |other: &FieldValue| stored.compare(&condition_operand(field, other));
    match (operator, value) {
        (Operator::Eq, ConditionValue::Single(v)) => cmp(v) == Some(Ordering::Equal),
        (Operator::Lt, ConditionValue::Single(v)) => cmp(v) == Some(Ordering::Less),
        (Operator::Le, ConditionValue::Single(v)) => {
            matches!(cmp(v), Some(Ordering::Less | Ordering::Equal))
        }
        (Operator::Gt, ConditionValue::Single(v)) => cmp(v) == Some(Ordering::Greater),
        (Operator::Ge, ConditionValue::Single(v)) => {
            matches!(cmp(v), Some(Ordering::Greater | Ordering::Equal))
        }
        (Operator::In, ConditionValue::List(list)) => {
            list.iter().any(|v| cmp(v) == Some(Ordering::Equal))
        }
        (Operator::Between, ConditionValue::Range(low, high)) => {
            matches!(cmp(low), Some(Ordering::Greater | Ordering::Equal))
                && matches!(cmp(high), Some(Ordering::Less | Ordering::Equal))
        }
        _ => false,
    }
}

fn condition_matches(index: &IndexDef, item: &StoredItem, condition: &Condition) -> bool {
    let field = match index.field(&condition.field) {
        Some(f) => f,
        None => return false,
    };
    let values = field_values(item, field);
    match (&condition.value, condition.operator) {
        (ConditionValue::Null, Operator::Eq) => values.is_empty(),
        (ConditionValue::Null, _) => !values.is_empty(),
        (value, op) if op.is_negative() => !values
            .iter()
            .any(|stored| value_matches(field, stored, op.positive(), value)),
        (value, op) => values
            .iter()
            .any(|stored| value_matches(field, stored, op, value)),
    }
}

fn group_matches(index: &IndexDef, item: &StoredItem, group: &ConditionGroup) -> bool {
    if group.children.is_empty() {
        return true;
    }
    let mut results = group.children.iter().map(|child| match child {
        ConditionNode::Condition(c) => condition_matches(index, item, c),
        ConditionNode::Group(g) => group_matches(index, item, g),
    });
    match group.conjunction {
        Conjunction::And => results.all(|m| m),
        Conjunction::Or => results.any(|m| m),
    }
}

/// Score of `keys` against an item, or `None` when it does not match.
fn keys_score(keys: &Keys, item: &StoredItem, fields: &[String], partial: bool) -> Option<f64> {
    match keys {
        Keys::Keyword(word) => {
            let mut matched = false;
            let mut score = 0.0;
            for field in fields {
                let Some(words) = item.words.get(field) else {
                    continue;
                };
                if partial {
                    for (token, s) in words {
                        if token.contains(word.as_str()) {
                            matched = true;
                            score += s;
                        }
                    }
                } else if let Some(s) = words.get(word) {
                    matched = true;
                    score += s;
                }
            }
            matched.then_some(score)
        }
        Keys::Group {
            conjunction,
            negation,
            children,
        } => {
            let inner = match conjunction {
                Conjunction::And => children
                    .iter()
                    .map(|c| keys_score(c, item, fields, partial))
                    .sum::<Option<f64>>(),
                Conjunction::Or => {
                    let scores: Vec<f64> = children
                        .iter()
                        .filter_map(|c| keys_score(c, item, fields, partial))
                        .collect();
                    (!scores.is_empty()).then(|| scores.iter().sum())
                }
            };
            if *negation {
                match inner {
                    Some(_) => None,
                    None => Some(0.0),
                }
            } else {
                inner
            }
        }
    }
}

fn sort_value(index: &IndexDef, item: &StoredItem, field: &str, direction: SortDirection) -> Option<FieldValue> {
    let field = index.field(field)?;
    let values = field_values(item, field);
    let pick = |a: &&FieldValue, b: &&FieldValue| a.compare(b).unwrap_or(Ordering::Equal);
    match direction {
        SortDirection::Asc => values.iter().min_by(pick).cloned(),
        SortDirection::Desc => values.iter().max_by(pick).cloned(),
    }
}

fn compare_nullable(a: Option<&FieldValue>, b: Option<&FieldValue>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn facet_buckets(
    index: &IndexDef,
    candidates: &[&StoredItem],
    conditions: &ConditionGroup,
    request: &FacetRequest,
) -> Vec<FacetBucket> {
    let Some(field) = index.field(&request.field) else {
        return Vec::new();
    };
    let effective = request.effective_conditions(conditions);
    let mut counts: BTreeMap<String, (FieldValue, usize)> = BTreeMap::new();
    let mut missing = 0;
    for item in candidates.iter().filter(|i| group_matches(index, i, &effective)) {
        let values = field_values(item, field);
        if values.is_empty() {
            missing += 1;
        }
        for value in values {
            counts
                .entry(value.filter_string())
                .or_insert_with(|| (value.clone(), 0))
                .1 += 1;
        }
    }
    let buckets = counts
        .into_values()
        .map(|(value, count)| FacetBucket::value(&value, count))
        .collect();
    finalize_facet(request, buckets, missing)
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    async fn add_index(&self, index: &IndexDef) -> Result<()> {
        index.validate()?;
        let mut indexes = self.write()?;
        indexes
            .entry(index.id.clone())
            .and_modify(|stored| stored.def = index.clone())
            .or_insert_with(|| StoredIndex {
                def: index.clone(),
                items: BTreeMap::new(),
            });
        Ok(())
    }

    async fn update_index(&self, index: &IndexDef) -> Result<()> {
        index.validate()?;
        let mut indexes = self.write()?;
        let stored = indexes
            .entry(index.id.clone())
            .or_insert_with(|| StoredIndex {
                def: index.clone(),
                items: BTreeMap::new(),
            });
        let stale: Vec<String> = stored
            .def
            .fields
            .iter()
            .filter(|old| match index.field(&old.name) {
                Some(new) => new.storage_differs(old),
                None => true,
            })
            .map(|f| f.name.clone())
            .collect();
        for item in stored.items.values_mut() {
            for name in &stale {
                item.values.remove(name);
                item.words.remove(name);
            }
        }
        stored.def = index.clone();
        Ok(())
    }

    async fn remove_index(&self, index: &IndexDef) -> Result<()> {
        self.write()?.remove(&index.id);
        Ok(())
    }

    async fn index_items(&self, index: &IndexDef, items: &[IndexedItem]) -> Result<Vec<ItemId>> {
        let mut indexes = self.write()?;
        let stored = indexes.get_mut(&index.id).ok_or_else(|| missing_index(&index.id))?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let row = store_item(&stored.def, item);
            stored.items.insert(item.id.to_string(), row);
            ids.push(item.id.clone());
        }
        Ok(ids)
    }

    async fn delete_items(&self, index: &IndexDef, ids: &[ItemId]) -> Result<()> {
        let mut indexes = self.write()?;
        if let Some(stored) = indexes.get_mut(&index.id) {
            for id in ids {
                stored.items.remove(&id.to_string());
            }
        }
        Ok(())
    }

    async fn delete_all_index_items(&self, index: &IndexDef) -> Result<()> {
        let mut indexes = self.write()?;
        if let Some(stored) = indexes.get_mut(&index.id) {
            stored.items.clear();
        }
        Ok(())
    }

    async fn stored_item_ids(&self, index: &IndexDef) -> Result<Vec<ItemId>> {
        let indexes = self.read()?;
        Ok(indexes
            .get(&index.id)
            .map(|s| s.items.values().map(|i| i.id.clone()).collect())
            .unwrap_or_default())
    }

    async fn search(&self, index: &IndexDef, query: &Query) -> Result<ResultSet> {
        query.validate(index)?;
        let indexes = self.read()?;
        let stored = indexes.get(&index.id).ok_or_else(|| missing_index(&index.id))?;

        let mut results = ResultSet::default();
        let partial = query.partial_matches.unwrap_or(self.settings.partial_matches);
        let fields = query.searched_fields(index);
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

        // Items passing the fulltext part, with their relevance.
        let candidates: Vec<(&StoredItem, f64)> = stored
            .items
            .values()
            .filter_map(|item| match &keys {
                Some(k) => keys_score(k, item, &fields, partial).map(|s| (item, s)),
                None => Some((item, 0.0)),
            })
            .collect();

        let mut matched: Vec<(&StoredItem, f64)> = candidates
            .iter()
            .filter(|(item, _)| group_matches(index, item, &query.conditions))
            .copied()
            .collect();
        results.result_count = matched.len();

        let mut sorts = query.sorts.clone();
        if sorts.is_empty() && keys.is_some() {
            sorts.push((RELEVANCE_FIELD.to_string(), SortDirection::Desc));
        }
        matched.sort_by(|(a, score_a), (b, score_b)| {
            let mut ordering = Ordering::Equal;
            for (field, direction) in &sorts {
                let asc = match field.as_str() {
                    RELEVANCE_FIELD => score_a.partial_cmp(score_b).unwrap_or(Ordering::Equal),
                    ID_FIELD => a.id.to_string().cmp(&b.id.to_string()),
                    name => compare_nullable(
                        sort_value(index, a, name, *direction).as_ref(),
                        sort_value(index, b, name, *direction).as_ref(),
                    ),
                };
                ordering = match direction {
                    SortDirection::Asc => asc,
                    SortDirection::Desc => asc.reverse(),
                };
                if ordering != Ordering::Equal {
                    break;
                }
            }
            ordering.then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });

        if query.limit != Some(0) {
            results.items = matched
                .iter()
                .skip(query.offset)
                .take(query.limit.unwrap_or(usize::MAX))
                .map(|(item, score)| ResultItem {
                    id: item.id.clone(),
                    score: *score,
                })
                .collect();
        }

        let facet_base: Vec<&StoredItem> = candidates.iter().map(|(item, _)| *item).collect();
        for request in &query.facets {
            results.facets.insert(
                request.field.clone(),
                facet_buckets(index, &facet_base, &query.conditions, request),
            );
        }
        Ok(results)
    }

    async fn schema_map(&self, index_id: &str) -> Result<Option<IndexSchema>> {
        let indexes = self.read()?;
        Ok(indexes.get(index_id).map(|s| IndexSchema::plan(&s.def)))
    }

    async fn uninstall(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }
}
