use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use search_harness::config::load_config;
use search_harness::indexing::{DefinitionChange, Engine};
use search_harness::progress::NoProgress;
use search_harness::sql_backend::SqlBackend;
use search_harness::{db, migrate};
use search_harness_core::backend::{Backend, BackendSettings};
use search_harness_core::clock::ManualClock;
use search_harness_core::datasource::Datasource;
use search_harness_core::error::{Result, SearchError};
use search_harness_core::models::{Field, FieldType, FieldValue, IndexDef, IndexedItem, ItemId, ItemValues};
use search_harness_core::query::{Keys, Query, ResultSet};
use search_harness_core::schema::IndexSchema;
use tempfile::TempDir;

/// Datasource backed by a map that tests edit directly.
struct StaticDatasource {
    items: Mutex<BTreeMap<String, String>>,
}

impl StaticDatasource {
    fn new(bodies: &[(&str, &str)]) -> Self {
        Self {
            items: Mutex::new(
                bodies
                    .iter()
                    .map(|(id, body)| (id.to_string(), body.to_string()))
                    .collect(),
            ),
        }
    }

    fn set(&self, id: &str, body: &str) {
        self.items.lock().unwrap().insert(id.to_string(), body.to_string());
    }

    fn remove(&self, id: &str) {
        self.items.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl Datasource for StaticDatasource {
    fn id(&self) -> &str {
        "notes"
    }

    async fn item_ids(&self) -> anyhow::Result<Vec<ItemId>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .keys()
            .map(|id| ItemId::new("notes", id.clone(), "en"))
            .collect())
    }

    async fn extract_field_values(&self, id: &ItemId, _fields: &[Field]) -> anyhow::Result<Option<ItemValues>> {
        Ok(self.items.lock().unwrap().get(&id.source_id).map(|body| {
            let mut values = ItemValues::new();
            values.insert("body".into(), vec![FieldValue::Text(body.clone())]);
            values
        }))
    }
}

/// SQL backend with a switch that makes every mutation fail, and one that
/// makes `index_items` store only the first item of each batch.
struct Switchable {
    inner: SqlBackend,
    down: AtomicBool,
    first_only: AtomicBool,
}

impl Switchable {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SearchError::backend("database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for Switchable {
    fn kind(&self) -> &str {
        self.inner.kind()
    }
    async fn ping(&self) -> Result<()> {
        self.check()?;
        self.inner.ping().await
    }
    async fn add_index(&self, index: &IndexDef) -> Result<()> {
        self.check()?;
        self.inner.add_index(index).await
    }
    async fn update_index(&self, index: &IndexDef) -> Result<()> {
        self.check()?;
        self.inner.update_index(index).await
    }
    async fn remove_index(&self, index: &IndexDef) -> Result<()> {
        self.check()?;
        self.inner.remove_index(index).await
    }
    async fn index_items(&self, index: &IndexDef, items: &[IndexedItem]) -> Result<Vec<ItemId>> {
        self.check()?;
        if self.first_only.load(Ordering::SeqCst) {
            return self.inner.index_items(index, &items[..items.len().min(1)]).await;
        }
        self.inner.index_items(index, items).await
    }
    async fn delete_items(&self, index: &IndexDef, ids: &[ItemId]) -> Result<()> {
        self.check()?;
        self.inner.delete_items(index, ids).await
    }
    async fn delete_all_index_items(&self, index: &IndexDef) -> Result<()> {
        self.check()?;
        self.inner.delete_all_index_items(index).await
    }
    async fn stored_item_ids(&self, index: &IndexDef) -> Result<Vec<ItemId>> {
        self.inner.stored_item_ids(index).await
    }
    async fn search(&self, index: &IndexDef, query: &Query) -> Result<ResultSet> {
        self.inner.search(index, query).await
    }
    async fn schema_map(&self, index_id: &str) -> Result<Option<IndexSchema>> {
        self.inner.schema_map(index_id).await
    }
    async fn uninstall(&self) -> Result<()> {
        self.inner.uninstall().await
    }
}

fn index() -> IndexDef {
    let mut index = IndexDef::new("notes", "default", "notes", vec![Field::new("body", FieldType::Text)]);
    index.options.cron_limit = 2;
    index
}

struct Setup {
    _tmp: TempDir,
    engine: Engine,
    backend: Arc<Switchable>,
    datasource: Arc<StaticDatasource>,
}

async fn setup() -> Setup {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("engine.sqlite")).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let backend = Arc::new(Switchable {
        inner: SqlBackend::new(pool.clone(), BackendSettings::default()),
        down: AtomicBool::new(false),
        first_only: AtomicBool::new(false),
    });
    let datasource = Arc::new(StaticDatasource::new(&[
        ("a", "apples and pears"),
        ("b", "pears only"),
        ("c", "cherries"),
        ("d", "dates and apples"),
        ("e", "elderberries"),
    ]));
    let mut engine = Engine::new(pool, Arc::new(ManualClock::new(1_700_000_000)), 300);
    engine.add_server("default", backend.clone());
    engine.add_datasource(datasource.clone());
    engine.add_index(index()).unwrap();
    Setup {
        _tmp: tmp,
        engine,
        backend,
        datasource,
    }
}

async fn assert_tracker_invariant(engine: &Engine) {
    let tracker = engine.tracker("notes");
    let total = tracker.get_total_items_count().await.unwrap();
    let indexed = tracker.get_indexed_items_count().await.unwrap();
    assert!(indexed <= total, "indexed {indexed} > total {total}");
}

async fn search_count(engine: &Engine, keys: Option<&str>) -> usize {
    let mut query = Query::new();
    if let Some(k) = keys.and_then(Keys::parse) {
        query = query.keys(k);
    }
    engine.search("notes", &query).await.unwrap().result_count
}

#[tokio::test]
async fn sync_track_and_index_in_batches() {
    let s = setup().await;
    let outcome = s.engine.sync_index("notes").await.unwrap();
    assert_eq!(outcome.change, DefinitionChange::Added);
    assert_eq!(
        s.engine.sync_index("notes").await.unwrap().change,
        DefinitionChange::Unchanged
    );

    let tracked = s.engine.track_datasource("notes", &NoProgress).await.unwrap();
    assert_eq!((tracked.total, tracked.added, tracked.removed), (5, 5, 0));
    assert_tracker_invariant(&s.engine).await;

    let report = s.engine.index_pending("notes", Some(3), &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.remaining, 2);
    assert_tracker_invariant(&s.engine).await;

    let report = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(search_count(&s.engine, None).await, 5);
    assert_eq!(search_count(&s.engine, Some("apples")).await, 2);
}

#[tokio::test]
async fn source_changes_flow_through_the_tracker() {
    let s = setup().await;
    s.engine.sync_index("notes").await.unwrap();
    s.engine.track_datasource("notes", &NoProgress).await.unwrap();
    s.engine.index_pending("notes", None, &NoProgress).await.unwrap();

    s.datasource.remove("a");
    s.datasource.set("f", "figs");
    let tracked = s.engine.track_datasource("notes", &NoProgress).await.unwrap();
    assert_eq!((tracked.added, tracked.removed), (1, 1));
    assert_eq!(search_count(&s.engine, Some("pears")).await, 1);

    s.datasource.set("b", "plums now");
    let marked = s
        .engine
        .items_changed("notes", &[ItemId::new("notes", "b", "en"), ItemId::new("notes", "zz", "en")])
        .await
        .unwrap();
    assert_eq!(marked, 1);

    // An item that vanished between tracking and indexing is dropped.
    s.datasource.remove("f");
    let report = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(search_count(&s.engine, Some("plums")).await, 1);
    assert_eq!(search_count(&s.engine, None).await, 4);
    assert_tracker_invariant(&s.engine).await;
}

#[tokio::test]
async fn outage_defers_indexing_until_the_sweep_recovers() {
    let s = setup().await;
    s.engine.sync_index("notes").await.unwrap();
    s.engine.track_datasource("notes", &NoProgress).await.unwrap();
    s.engine.index_pending("notes", Some(2), &NoProgress).await.unwrap();

    s.backend.down.store(true, Ordering::SeqCst);
    let report = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 0);
    assert_eq!(report.remaining, 3);
    assert!(report.deferred.is_some());
    assert_tracker_invariant(&s.engine).await;

    // Backend is back, but the queued task still fences indexing.
    s.backend.down.store(false, Ordering::SeqCst);
    let fenced = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert!(fenced.deferred.unwrap().contains("pending task"));

    let sweeps = s.engine.execute_all_tasks().await.unwrap();
    assert_eq!(sweeps[0].executed, 1);
    assert_eq!(sweeps[0].remaining, 0);

    let report = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(search_count(&s.engine, None).await, 5);
}

#[tokio::test]
async fn items_the_backend_declines_stay_pending_without_looping() {
    let s = setup().await;
    s.engine.sync_index("notes").await.unwrap();
    s.engine.track_datasource("notes", &NoProgress).await.unwrap();

    s.backend.first_only.store(true, Ordering::SeqCst);
    let report = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.remaining, 2);
    assert!(report.deferred.is_none());
    assert_tracker_invariant(&s.engine).await;

    s.backend.first_only.store(false, Ordering::SeqCst);
    let report = s.engine.index_pending("notes", None, &NoProgress).await.unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(search_count(&s.engine, None).await, 5);
}

#[tokio::test]
async fn memory_server_storage_is_restored_by_the_next_engine() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    std::fs::create_dir_all(root.join("content")).unwrap();
    std::fs::write(root.join("content/one.json"), r#"{"language": "en", "body": "apples"}"#).unwrap();
    std::fs::write(root.join("content/two.json"), r#"{"language": "en", "body": "pears"}"#).unwrap();
    let config_path = root.join("sidx.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"[db]
path = "{root}/search.sqlite"

[servers.scratch]
backend = "memory"

[datasources.docs]
root = "{root}/content"

[indexes.docs]
server = "scratch"
datasource = "docs"

[[indexes.docs.fields]]
name = "body"
type = "text"
"#,
            root = root.display()
        ),
    )
    .unwrap();
    let config = load_config(&config_path).unwrap();

    let first = Engine::from_config(&config).await.unwrap();
    first.sync_index("docs").await.unwrap();
    first.track_datasource("docs", &NoProgress).await.unwrap();
    assert_eq!(first.index_pending("docs", None, &NoProgress).await.unwrap().indexed, 2);
    first.pool().close().await;
    drop(first);

    // A new process starts with an empty memory server.
    let second = Engine::from_config(&config).await.unwrap();
    assert_eq!(
        second.sync_index("docs").await.unwrap().change,
        DefinitionChange::Unchanged
    );
    assert_eq!(second.search("docs", &Query::new()).await.unwrap().result_count, 0);
    assert_eq!(second.tracker("docs").get_indexed_items_count().await.unwrap(), 0);

    let report = second.index_pending("docs", None, &NoProgress).await.unwrap();
    assert_eq!((report.indexed, report.remaining), (2, 0));
    let results = second
        .search("docs", &Query::new().keys(Keys::parse("pears").unwrap()))
        .await
        .unwrap();
    assert_eq!(results.result_count, 1);
    assert!(second.restore_missing_storage().await.unwrap().is_empty());
}

#[tokio::test]
async fn definition_changes_mark_items_for_reindexing() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("engine.sqlite")).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let datasource = Arc::new(StaticDatasource::new(&[("a", "apples"), ("b", "bananas")]));
    let clock = Arc::new(ManualClock::new(1_700_000_000));

    let build = |index: IndexDef| {
        let mut engine = Engine::new(pool.clone(), clock.clone(), 300);
        engine.add_server(
            "default",
            Arc::new(SqlBackend::new(pool.clone(), BackendSettings::default())),
        );
        engine.add_datasource(datasource.clone());
        engine.add_index(index).unwrap();
        engine
    };

    let engine = build(index());
    engine.sync_index("notes").await.unwrap();
    engine.track_datasource("notes", &NoProgress).await.unwrap();
    engine.index_pending("notes", None, &NoProgress).await.unwrap();

    // Only the batch size changed: the stored data stays valid.
    let mut tuned = index();
    tuned.options.cron_limit = 10;
    let engine = build(tuned.clone());
    let outcome = engine.sync_index("notes").await.unwrap();
    assert_eq!(outcome.change, DefinitionChange::Updated { reindex: false });
    assert_eq!(engine.tracker("notes").get_indexed_items_count().await.unwrap(), 2);

    tuned.fields.push(Field::new("tags", FieldType::String).multi());
    let engine = build(tuned);
    let outcome = engine.sync_index("notes").await.unwrap();
    assert_eq!(outcome.change, DefinitionChange::Updated { reindex: true });
    assert_eq!(engine.tracker("notes").get_indexed_items_count().await.unwrap(), 0);
    assert_eq!(engine.search("notes", &Query::new()).await.unwrap().result_count, 2);

    engine.index_pending("notes", None, &NoProgress).await.unwrap();
    let cleared = engine.clear("notes").await.unwrap();
    assert!(cleared.is_none());
    assert_eq!(engine.search("notes", &Query::new()).await.unwrap().result_count, 0);
    assert_eq!(engine.tracker("notes").get_total_items_count().await.unwrap(), 2);
    assert_eq!(engine.tracker("notes").get_indexed_items_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_indexes_and_servers_are_rejected() {
    let s = setup().await;
    assert!(s.engine.sync_index("missing").await.is_err());
    let err = s.engine.search("missing", &Query::new()).await.unwrap_err();
    assert!(matches!(err, SearchError::Config(_)));

    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("x.sqlite")).await.unwrap();
    let mut engine = Engine::new(pool, Arc::new(ManualClock::new(0)), 300);
    let mut orphan = index();
    orphan.server = "nowhere".into();
    assert!(engine.add_index(orphan).is_err());
}

#[tokio::test]
async fn uninstall_drops_every_search_table() {
    let s = setup().await;
    s.engine.sync_index("notes").await.unwrap();
    s.engine.track_datasource("notes", &NoProgress).await.unwrap();
    s.engine.index_pending("notes", None, &NoProgress).await.unwrap();

    let dropped = s.engine.uninstall().await.unwrap();
    assert!(dropped.iter().any(|t| t == "search_tracker"));
    assert!(dropped.iter().any(|t| t == "search_tasks"));
    let left: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'search\\_%' ESCAPE '\\'",
    )
    .fetch_one(s.engine.pool())
    .await
    .unwrap();
    assert_eq!(left, 0);
}
