use std::collections::BTreeMap;

use search_harness::{db, migrate, sql_backend::SqlBackend};
use search_harness_core::backend::{Backend, BackendSettings};
use search_harness_core::error::SearchError;
use search_harness_core::models::{Field, FieldType, FieldValue, IndexDef, IndexedItem, ItemId, ItemValues};
use search_harness_core::query::{
    facet_tag, Conjunction, ConditionGroup, ConditionValue, FacetBucket, FacetOperator, FacetRequest,
    Keys, Operator, Query, SortDirection, NO_VALID_KEYS_WARNING,
};
use search_harness_core::schema::StorageKind;
use sqlx::SqlitePool;
use tempfile::TempDir;

async fn setup(settings: BackendSettings) -> (TempDir, SqlitePool, SqlBackend) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("search.sqlite")).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let backend = SqlBackend::new(pool.clone(), settings);
    (tmp, pool, backend)
}

fn index() -> IndexDef {
    IndexDef::new(
        "content",
        "default",
        "articles",
        vec![
            Field::new("body", FieldType::Text),
            Field::new("category", FieldType::String),
            Field::new("tags", FieldType::String).multi(),
            Field::new("price", FieldType::Decimal),
        ],
    )
}

fn text(s: &str) -> FieldValue {
    FieldValue::Text(s.to_string())
}

fn item(source: &str, body: &str, category: Option<&str>, tags: &[&str], price: Option<f64>) -> IndexedItem {
    let mut values = ItemValues::new();
    values.insert("body".into(), vec![text(body)]);
    if let Some(c) = category {
        values.insert("category".into(), vec![text(c)]);
    }
    if !tags.is_empty() {
        values.insert("tags".into(), tags.iter().map(|t| text(t)).collect());
    }
    if let Some(p) = price {
        values.insert("price".into(), vec![FieldValue::Decimal(p)]);
    }
    IndexedItem::new(ItemId::new("articles", source, "en"), values)
}

fn sample_items() -> Vec<IndexedItem> {
    vec![
        item("1", "Solar panels on the roof", Some("item"), &["A", "B"], Some(10.0)),
        item("2", "Wind turbines and solar farms", Some("item"), &["B"], Some(25.5)),
        item("3", "A test of batteries", Some("article"), &[], None),
    ]
}

async fn indexed_backend(settings: BackendSettings) -> (TempDir, SqlitePool, SqlBackend) {
    let (tmp, pool, backend) = setup(settings).await;
    backend.add_index(&index()).await.unwrap();
    let stored = backend.index_items(&index(), &sample_items()).await.unwrap();
    assert_eq!(stored.len(), 3);
    (tmp, pool, backend)
}

fn sources(results: &search_harness_core::query::ResultSet) -> Vec<String> {
    results.items.iter().map(|i| i.id.source_id.clone()).collect()
}

#[tokio::test]
async fn round_trip_then_delete() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let all = backend.search(&index(), &Query::new()).await.unwrap();
    assert_eq!(all.result_count, 3);
    assert_eq!(sources(&all), vec!["1", "2", "3"]);

    // Reindexing the same item replaces it instead of duplicating it.
    backend
        .index_items(&index(), &[item("1", "Solar panels", Some("item"), &["A"], None)])
        .await
        .unwrap();
    assert_eq!(backend.search(&index(), &Query::new()).await.unwrap().result_count, 3);

    backend
        .delete_items(&index(), &[ItemId::new("articles", "1", "en")])
        .await
        .unwrap();
    let after = backend.search(&index(), &Query::new()).await.unwrap();
    assert_eq!(sources(&after), vec!["2", "3"]);
    let keyed = backend
        .search(&index(), &Query::new().keys(Keys::keyword("panels")))
        .await
        .unwrap();
    assert_eq!(keyed.result_count, 0);
}

#[tokio::test]
async fn multi_valued_negation() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;

    let not_c = Query::new().condition("tags", ConditionValue::Single(text("C")), Operator::NotEq);
    assert_eq!(sources(&backend.search(&index(), &not_c).await.unwrap()), vec!["1", "2", "3"]);

    let not_a = Query::new().condition("tags", ConditionValue::Single(text("A")), Operator::NotEq);
    assert_eq!(sources(&backend.search(&index(), &not_a).await.unwrap()), vec!["2", "3"]);

    let not_in = Query::new().condition(
        "tags",
        ConditionValue::List(vec![text("A"), text("B")]),
        Operator::NotIn,
    );
    assert_eq!(sources(&backend.search(&index(), &not_in).await.unwrap()), vec!["3"]);
}

#[tokio::test]
async fn null_conditions_test_presence() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let no_price = Query::new().condition("price", ConditionValue::Null, Operator::Eq);
    assert_eq!(sources(&backend.search(&index(), &no_price).await.unwrap()), vec!["3"]);
    let has_tags = Query::new().condition("tags", ConditionValue::Null, Operator::NotEq);
    assert_eq!(sources(&backend.search(&index(), &has_tags).await.unwrap()), vec!["1", "2"]);

    // Single-valued <> keeps items without a value.
    let not_cheap = Query::new().condition("price", ConditionValue::Single(FieldValue::Decimal(10.0)), Operator::NotEq);
    assert_eq!(sources(&backend.search(&index(), &not_cheap).await.unwrap()), vec!["2", "3"]);

    let range = Query::new().condition(
        "price",
        ConditionValue::Range(FieldValue::Decimal(5.0), FieldValue::Decimal(20.0)),
        Operator::Between,
    );
    assert_eq!(sources(&backend.search(&index(), &range).await.unwrap()), vec!["1"]);
}

#[tokio::test]
async fn or_groups_and_empty_groups() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let group = ConditionGroup::new(Conjunction::Or)
        .condition("category", ConditionValue::Single(text("article")), Operator::Eq)
        .condition("tags", ConditionValue::Single(text("A")), Operator::Eq);
    let query = Query::new().condition_group(group);
    assert_eq!(sources(&backend.search(&index(), &query).await.unwrap()), vec!["1", "3"]);

    let empty = Query::new().condition_group(ConditionGroup::new(Conjunction::And));
    assert_eq!(backend.search(&index(), &empty).await.unwrap().result_count, 3);
}

#[tokio::test]
async fn partial_match_toggle() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let exact = Query::new().keys(Keys::keyword("tes"));
    assert_eq!(backend.search(&index(), &exact).await.unwrap().result_count, 0);

    let partial = Query::new().keys(Keys::keyword("tes")).partial_matches(true);
    assert_eq!(sources(&backend.search(&index(), &partial).await.unwrap()), vec!["3"]);

    let (_tmp2, _pool2, partial_backend) = indexed_backend(BackendSettings {
        min_chars: 1,
        partial_matches: true,
    })
    .await;
    assert_eq!(partial_backend.search(&index(), &exact).await.unwrap().result_count, 1);
    let disabled = Query::new().keys(Keys::keyword("tes")).partial_matches(false);
    assert_eq!(partial_backend.search(&index(), &disabled).await.unwrap().result_count, 0);
}

#[tokio::test]
async fn keywords_and_relevance() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let solar = backend
        .search(&index(), &Query::new().keys(Keys::keyword("SOLAR")))
        .await
        .unwrap();
    assert_eq!(solar.result_count, 2);
    assert!(solar.items.iter().all(|i| i.score > 0.0));

    let solar_not_wind = Keys::and(vec![Keys::keyword("solar"), Keys::keyword("wind").negate()]);
    let results = backend
        .search(&index(), &Query::new().keys(solar_not_wind))
        .await
        .unwrap();
    assert_eq!(sources(&results), vec!["1"]);

    let either = Keys::parse("batteries OR turbines").unwrap();
    let results = backend
        .search(&index(), &Query::new().keys(either).sort("search_api_id", SortDirection::Asc))
        .await
        .unwrap();
    assert_eq!(sources(&results), vec!["2", "3"]);
}

#[tokio::test]
async fn short_keys_are_ignored_with_warning() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings {
        min_chars: 3,
        partial_matches: false,
    })
    .await;
    let results = backend
        .search(&index(), &Query::new().keys(Keys::keyword("of")))
        .await
        .unwrap();
    assert_eq!(results.ignored_keys, vec!["of".to_string()]);
    assert_eq!(results.warnings, vec![NO_VALID_KEYS_WARNING.to_string()]);
    assert_eq!(results.result_count, 3);
}

#[tokio::test]
async fn sorting_puts_missing_values_last_ascending() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let asc = Query::new().sort("price", SortDirection::Asc);
    assert_eq!(sources(&backend.search(&index(), &asc).await.unwrap()), vec!["1", "2", "3"]);
    let desc = Query::new().sort("price", SortDirection::Desc);
    assert_eq!(sources(&backend.search(&index(), &desc).await.unwrap()), vec!["3", "2", "1"]);

    let paged = Query::new().sort("price", SortDirection::Asc).range(1, Some(1));
    let page = backend.search(&index(), &paged).await.unwrap();
    assert_eq!(page.result_count, 3);
    assert_eq!(sources(&page), vec!["2"]);

    let count_only = backend.search(&index(), &Query::new().range(0, Some(0))).await.unwrap();
    assert_eq!(count_only.result_count, 3);
    assert!(count_only.items.is_empty());
}

#[tokio::test]
async fn facet_scenario_counts_categories() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let query = Query::new().facet(FacetRequest::new("category").missing(true).min_count(1));
    let results = backend.search(&index(), &query).await.unwrap();
    assert_eq!(
        results.facets["category"],
        vec![FacetBucket { filter: "\"item\"".into(), count: 2 }, FacetBucket { filter: "\"article\"".into(), count: 1 }]
    );

    let tags = backend
        .search(&index(), &Query::new().facet(FacetRequest::new("tags").missing(true)))
        .await
        .unwrap();
    assert_eq!(
        tags.facets["tags"],
        vec![
            FacetBucket { filter: "\"B\"".into(), count: 2 },
            FacetBucket { filter: "\"A\"".into(), count: 1 },
            FacetBucket { filter: "!".into(), count: 1 },
        ]
    );
}

#[tokio::test]
async fn or_facets_ignore_their_own_filter() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let selected = ConditionGroup::new(Conjunction::Or)
        .tag(facet_tag("category"))
        .condition("category", ConditionValue::Single(text("article")), Operator::Eq);

    let or_query = Query::new()
        .condition_group(selected.clone())
        .facet(FacetRequest::new("category").operator(FacetOperator::Or));
    let results = backend.search(&index(), &or_query).await.unwrap();
    assert_eq!(results.result_count, 1);
    let counts: BTreeMap<String, usize> = results.facets["category"]
        .iter()
        .map(|b| (b.filter.clone(), b.count))
        .collect();
    assert_eq!(counts["\"item\""], 2);
    assert_eq!(counts["\"article\""], 1);

    let and_query = Query::new()
        .condition_group(selected)
        .facet(FacetRequest::new("category"));
    let results = backend.search(&index(), &and_query).await.unwrap();
    assert_eq!(
        results.facets["category"],
        vec![FacetBucket { filter: "\"article\"".into(), count: 1 }]
    );
}

async fn tagged_backend() -> (TempDir, SqlitePool, SqlBackend) {
    let (tmp, pool, backend) = setup(BackendSettings::default()).await;
    backend.add_index(&index()).await.unwrap();
    backend
        .index_items(
            &index(),
            &[
                item("1", "first", None, &["A", "B"], None),
                item("2", "second", None, &["A"], None),
                item("3", "third", None, &["B"], None),
                item("4", "fourth", None, &[], None),
            ],
        )
        .await
        .unwrap();
    (tmp, pool, backend)
}

fn tag(value: &str) -> ConditionValue {
    ConditionValue::Single(text(value))
}

#[tokio::test]
async fn conditions_on_one_multi_valued_field_match_per_value() {
    let (_tmp, _pool, backend) = tagged_backend().await;

    let both = Query::new()
        .condition("tags", tag("A"), Operator::Eq)
        .condition("tags", tag("B"), Operator::Eq);
    assert_eq!(sources(&backend.search(&index(), &both).await.unwrap()), vec!["1"]);

    let either = Query::new().condition_group(
        ConditionGroup::new(Conjunction::Or)
            .condition("tags", tag("A"), Operator::Eq)
            .condition("tags", tag("B"), Operator::NotEq),
    );
    assert_eq!(
        sources(&backend.search(&index(), &either).await.unwrap()),
        vec!["1", "2", "4"]
    );
}

#[tokio::test]
async fn or_facets_on_multi_valued_fields() {
    let (_tmp, _pool, backend) = tagged_backend().await;
    let selected = ConditionGroup::new(Conjunction::Or)
        .tag(facet_tag("tags"))
        .condition("tags", tag("A"), Operator::Eq);

    let or_query = Query::new()
        .condition_group(selected.clone())
        .facet(FacetRequest::new("tags").operator(FacetOperator::Or));
    let results = backend.search(&index(), &or_query).await.unwrap();
    assert_eq!(sources(&results), vec!["1", "2"]);
    assert_eq!(
        results.facets["tags"],
        vec![
            FacetBucket { filter: "\"A\"".into(), count: 2 },
            FacetBucket { filter: "\"B\"".into(), count: 2 },
        ]
    );

    let and_query = Query::new()
        .condition_group(selected)
        .facet(FacetRequest::new("tags"));
    let results = backend.search(&index(), &and_query).await.unwrap();
    assert_eq!(
        results.facets["tags"],
        vec![
            FacetBucket { filter: "\"A\"".into(), count: 2 },
            FacetBucket { filter: "\"B\"".into(), count: 1 },
        ]
    );
}

#[tokio::test]
async fn query_errors_are_not_transient() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let unknown = Query::new().condition("colour", ConditionValue::Single(text("red")), Operator::Eq);
    let err = backend.search(&index(), &unknown).await.unwrap_err();
    assert!(matches!(err, SearchError::UnknownField { .. }));

    let bad_shape = Query::new().condition("tags", ConditionValue::Single(text("A")), Operator::In);
    assert!(matches!(
        backend.search(&index(), &bad_shape).await.unwrap_err(),
        SearchError::InvalidQuery(_)
    ));

    let text_sort = Query::new().sort("body", SortDirection::Asc);
    assert!(!backend.search(&index(), &text_sort).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn retyping_a_field_recreates_only_its_storage() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    let mut changed = index();
    changed.fields[1] = Field::new("category", FieldType::String).multi();
    backend.update_index(&changed).await.unwrap();

    let schema = backend.schema_map("content").await.unwrap().unwrap();
    assert_eq!(schema.field_tables["category"].storage, StorageKind::Values);
    assert!(schema.field_tables["category"].multi_valued);

    // Other fields keep their data; the retyped one is empty until reindexed.
    let priced = Query::new().condition("price", ConditionValue::Null, Operator::NotEq);
    assert_eq!(backend.search(&changed, &priced).await.unwrap().result_count, 2);
    let categorized = Query::new().condition("category", ConditionValue::Null, Operator::NotEq);
    assert_eq!(backend.search(&changed, &categorized).await.unwrap().result_count, 0);

    // Applying the same definition again is a no-op.
    backend.update_index(&changed).await.unwrap();
    assert_eq!(backend.schema_map("content").await.unwrap().unwrap(), schema);
}

#[tokio::test]
async fn delete_all_and_uninstall() {
    let (_tmp, pool, backend) = indexed_backend(BackendSettings::default()).await;
    backend.delete_all_index_items(&index()).await.unwrap();
    assert_eq!(backend.search(&index(), &Query::new()).await.unwrap().result_count, 0);
    assert!(backend.stored_item_ids(&index()).await.unwrap().is_empty());

    backend.uninstall().await.unwrap();
    assert!(backend.schema_map("content").await.unwrap().is_none());
    let leftover: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'search\\_content%' ESCAPE '\\'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn removing_an_index_twice_is_harmless() {
    let (_tmp, _pool, backend) = indexed_backend(BackendSettings::default()).await;
    backend.remove_index(&index()).await.unwrap();
    backend.remove_index(&index()).await.unwrap();
    assert!(backend.schema_map("content").await.unwrap().is_none());
    let err = backend.search(&index(), &Query::new()).await.unwrap_err();
    assert!(matches!(err, SearchError::Schema(_)));
}
