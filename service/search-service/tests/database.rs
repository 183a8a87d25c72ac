use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use search_backends::{EmptyCursor, ResultCursor, SearchBackend, SessionState, SqliteBackend, SqliteParams, TantivyParams};
use search_service::{BackendConfig, Database, DatabaseConfig, Document, Field, Query, Schema, SearchError, SortOrder, Value};

fn schema() -> Schema {
    Schema::builder()
        .field("sku", Field::identifier().stored())
        .field("name", Field::short_text().stored().sortable())
        .field("description", Field::long_text())
        .field("stock", Field::numeric().stored())
        .build()
        .unwrap()
}

fn configs(root: &Path) -> Vec<DatabaseConfig> {
    vec![
        DatabaseConfig::new("shop", BackendConfig::Tantivy(TantivyParams::new(root.join("tantivy")))),
        DatabaseConfig::new("shop", BackendConfig::Sqlite(SqliteParams::new(root.join("sqlite")))),
    ]
}

fn item(sku: &str, name: &str, stock: i64) -> Document {
    Document::new()
        .with("sku", sku)
        .with("name", name)
        .with("description", format!("{name} in stock"))
        .with("stock", stock)
}

#[test]
fn config_parses_every_engine() {
    let cfg = DatabaseConfig::from_json(r#"{"prefix":"shop","backend":{"engine":"tantivy","index_dir":"/tmp/idx"}}"#).unwrap();
    match cfg.backend {
        BackendConfig::Tantivy(p) => assert_eq!(p.writer_memory_bytes, 50_000_000),
        other => panic!("unexpected {other:?}"),
    }
    let cfg = DatabaseConfig::from_json(r#"{"prefix":"shop","backend":{"engine":"sqlite","index_dir":"/tmp/idx"}}"#).unwrap();
    assert!(matches!(cfg.backend, BackendConfig::Sqlite(_)));
    let cfg = DatabaseConfig::from_json(
        r#"{"prefix":"shop","backend":{"engine":"elasticsearch","hosts":["http://es:9200"],"bulk_size":50}}"#,
    )
    .unwrap();
    match cfg.backend {
        BackendConfig::Elasticsearch(p) => {
            assert_eq!(p.hosts, vec!["http://es:9200"]);
            assert_eq!(p.bulk_size, 50);
            assert_eq!(p.timeout_secs, 30);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn config_rejects_missing_prefix_and_unknown_engine() {
    let err = DatabaseConfig::from_json(r#"{"prefix":"  ","backend":{"engine":"sqlite","index_dir":"x"}}"#).unwrap_err();
    assert!(matches!(err, SearchError::InvalidConfig(_)));
    let err = DatabaseConfig::from_json(r#"{"prefix":"p","backend":{"engine":"solr"}}"#).unwrap_err();
    assert!(matches!(err, SearchError::InvalidConfig(_)));
    let cfg = DatabaseConfig::new("", BackendConfig::default());
    assert!(matches!(Database::open(&cfg, "items", schema()), Err(SearchError::InvalidConfig(_))));
}

#[test]
fn write_then_read_through_the_facade() {
    let tmp = tempfile::tempdir().unwrap();
    for cfg in configs(tmp.path()) {
        let mut db = Database::open(&cfg, "items", schema()).unwrap();
        assert_eq!(db.name(), "items");
        db.begin().unwrap();
        assert_eq!(db.state(), SessionState::Write);
        db.add(&item("A-1", "Widget", 12)).unwrap();
        db.add(&item("B-2", "gadget", 0)).unwrap();
        db.commit().unwrap();

        let hit = db.get(&Query::and().filter("sku", "A-1")).unwrap().unwrap();
        assert_eq!(hit.get("name"), Some(&Value::from("Widget")), "{}", db.engine());
        assert_eq!(hit.get("stock"), Some(&Value::Integer(12)), "{}", db.engine());
        assert!(db.get(&Query::and().filter("sku", "Z-9")).unwrap().is_none());

        let mut cursor = db.find(&Query::and(), &SortOrder::new().asc("name")).unwrap();
        let names: Vec<String> = cursor.page(1, 10).unwrap().iter().map(|d| d.get("name").unwrap().to_string()).collect();
        assert_eq!(names, vec!["gadget", "Widget"]);
        drop(cursor);

        db.remove_document("B-2").unwrap();
        db.replace_document("A-1", &item("A-1", "Widget Pro", 3)).unwrap();
        db.commit().unwrap();
        let mut cursor = db.find(&Query::and(), &SortOrder::new()).unwrap();
        let docs = cursor.page(1, 10).unwrap();
        assert_eq!(cursor.total_rows(), Some(1));
        assert_eq!(docs[0].get("name"), Some(&Value::from("Widget Pro")));
        drop(cursor);
        db.close().unwrap();
    }
}

#[test]
fn embedded_indexes_live_under_prefix_and_name() {
    let tmp = tempfile::tempdir().unwrap();
    for cfg in configs(tmp.path()) {
        let mut db = Database::open(&cfg, "items", schema()).unwrap();
        db.add(&item("A-1", "Widget", 1)).unwrap();
        db.commit().unwrap();
    }
    assert!(tmp.path().join("tantivy/shop/items/meta.json").exists());
    assert!(tmp.path().join("sqlite/shop/items/index.sqlite3").exists());
}

#[test]
fn facade_validates_before_the_engine() {
    let tmp = tempfile::tempdir().unwrap();
    for cfg in configs(tmp.path()) {
        let mut db = Database::open(&cfg, "items", schema()).unwrap();
        let err = db.add(&item("A-1", "Widget", 1).with("colour", "red")).unwrap_err();
        assert!(matches!(err, SearchError::SchemaViolation(_)));
        assert_eq!(db.state(), SessionState::Closed, "nothing opened for a rejected document");

        let err = db.find(&Query::and(), &SortOrder::new().desc("colour")).err().unwrap();
        assert!(err.to_string().contains("sku,name,description,stock"));
        assert!(matches!(db.commit(), Err(SearchError::InvalidState(_))));
    }
}

#[test]
fn dropping_a_database_discards_uncommitted_writes() {
    let tmp = tempfile::tempdir().unwrap();
    for cfg in configs(tmp.path()) {
        {
            let mut db = Database::open(&cfg, "drafts", schema()).unwrap();
            db.add(&item("A-1", "Draft", 1)).unwrap();
        }
        let mut db = Database::open(&cfg, "drafts", schema()).unwrap();
        assert!(db.get(&Query::and()).unwrap().is_none());
        // lock was released by the drop
        db.begin().unwrap();
        db.rollback().unwrap();
    }
}

#[test]
fn wraps_a_prebuilt_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::new("custom", Arc::new(schema()), SqliteParams::new(tmp.path())).unwrap();
    let mut db = Database::with_backend("custom", Box::new(backend));
    assert_eq!(db.engine(), "sqlite");
    db.add(&item("A-1", "Widget", 1)).unwrap();
    db.commit().unwrap();
    assert!(db.get(&Query::and().lookup("stock__ge", 1)).unwrap().is_some());
}

/// Backend whose close always fails, counting the attempts.
struct FailingClose {
    schema: Schema,
    closes: Arc<AtomicUsize>,
}

impl SearchBackend for FailingClose {
    fn name(&self) -> &'static str { "failing" }
    fn schema(&self) -> &Schema { &self.schema }
    fn state(&self) -> SessionState { SessionState::Write }
    fn open(&mut self, _write: bool) -> search_service::Result<()> { Ok(()) }
    fn close(&mut self) -> search_service::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(SearchError::BackendUnavailable("lock release failed".into()))
    }
    fn commit(&mut self) -> search_service::Result<()> { Ok(()) }
    fn rollback(&mut self) -> search_service::Result<()> { Ok(()) }
    fn add(&mut self, _doc: &Document) -> search_service::Result<()> { Ok(()) }
    fn replace(&mut self, _id: &str, _doc: &Document) -> search_service::Result<()> { Ok(()) }
    fn remove(&mut self, _id: &str) -> search_service::Result<()> { Ok(()) }
    fn find<'a>(&'a mut self, _query: &Query, _order: &SortOrder) -> search_service::Result<Box<dyn ResultCursor + 'a>> {
        Ok(Box::new(EmptyCursor::default()))
    }
}

#[test]
fn drop_attempts_close_once_even_when_it_fails() {
    let closes = Arc::new(AtomicUsize::new(0));
    let backend = FailingClose { schema: schema(), closes: closes.clone() };
    {
        let db = Database::with_backend("broken", Box::new(backend));
        assert_eq!(db.engine(), "failing");
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
