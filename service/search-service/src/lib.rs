use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use search_backends::{
    ElasticBackend, ElasticParams, ResultCursor, SearchBackend, SessionState, SqliteBackend, SqliteParams,
    TantivyBackend, TantivyParams,
};
pub use search_model::{Document, Field, FieldKind, Query, Result, Schema, SearchError, SortOrder, Value};

/// Engine selection plus its connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum BackendConfig {
    Tantivy(TantivyParams),
    Sqlite(SqliteParams),
    Elasticsearch(ElasticParams),
}

impl Default for BackendConfig {
    fn default() -> Self { BackendConfig::Sqlite(SqliteParams::new("target/search")) }
}

/// Explicit configuration for opening a [`Database`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Namespace shared by every database opened with this config.
    pub prefix: String,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self { Self { prefix: "search".into(), backend: BackendConfig::default() } }
}

impl DatabaseConfig {
    pub fn new(prefix: impl Into<String>, backend: BackendConfig) -> Self { Self { prefix: prefix.into(), backend } }

    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| SearchError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.trim().is_empty() {
            return Err(SearchError::InvalidConfig("database prefix must be set".into()));
        }
        if let BackendConfig::Elasticsearch(p) = &self.backend {
            if p.hosts.is_empty() {
                return Err(SearchError::InvalidConfig("elasticsearch needs at least one host".into()));
            }
        }
        Ok(())
    }

    fn embedded_root(&self, index_dir: &std::path::Path) -> PathBuf { index_dir.join(&self.prefix) }
}

/// One logical database over whichever engine the config selects.
pub struct Database {
    name: String,
    backend: Box<dyn SearchBackend>,
}

impl Database {
    /// Build the configured adapter for `dbname`. Nothing is touched on
    /// disk or over the network until the first read or write.
    pub fn open(config: &DatabaseConfig, dbname: &str, schema: impl Into<Arc<Schema>>) -> Result<Self> {
        config.validate()?;
        if dbname.trim().is_empty() {
            return Err(SearchError::InvalidConfig("database name must not be empty".into()));
        }
        let schema = schema.into();
        let backend: Box<dyn SearchBackend> = match &config.backend {
            BackendConfig::Tantivy(p) => {
                let params = TantivyParams { index_dir: config.embedded_root(&p.index_dir), ..p.clone() };
                Box::new(TantivyBackend::new(dbname, schema, params)?)
            }
            BackendConfig::Sqlite(p) => {
                Box::new(SqliteBackend::new(dbname, schema, SqliteParams::new(config.embedded_root(&p.index_dir)))?)
            }
            BackendConfig::Elasticsearch(p) => {
                Box::new(ElasticBackend::new(&format!("{}_{}", config.prefix, dbname), schema, p.clone())?)
            }
        };
        info!(prefix = %config.prefix, db = dbname, engine = backend.name(), "database configured");
        Ok(Self::with_backend(dbname, backend))
    }

    /// Wrap an already-built adapter.
    pub fn with_backend(name: impl Into<String>, backend: Box<dyn SearchBackend>) -> Self {
        Self { name: name.into(), backend }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn schema(&self) -> &Schema { self.backend.schema() }
    pub fn engine(&self) -> &'static str { self.backend.name() }
    pub fn state(&self) -> SessionState { self.backend.state() }

    /// Start a write session, taking the index lock.
    pub fn begin(&mut self) -> Result<()> { self.backend.open(true) }

    pub fn add(&mut self, doc: &Document) -> Result<()> {
        self.schema().validate(doc)?;
        self.backend.add(doc)
    }

    pub fn replace_document(&mut self, id: &str, doc: &Document) -> Result<()> {
        self.schema().validate(doc)?;
        self.backend.replace(id, doc)
    }

    pub fn remove_document(&mut self, id: &str) -> Result<()> { self.backend.remove(id) }

    /// First hit of the first page, if any.
    pub fn get(&mut self, query: &Query) -> Result<Option<Document>> {
        let mut cursor = self.find(query, &SortOrder::new())?;
        Ok(cursor.page(1, 20)?.into_iter().next())
    }

    pub fn find(&mut self, query: &Query, order: &SortOrder) -> Result<Box<dyn ResultCursor + '_>> {
        for (field, _) in order.keys() {
            if !self.schema().contains(field) {
                return Err(SearchError::SchemaViolation(format!(
                    "cannot order by {field}: not in {}",
                    self.schema().field_names().join(",")
                )));
            }
        }
        debug!(db = %self.name, query = %query, "find");
        self.backend.find(query, order)
    }

    pub fn commit(&mut self) -> Result<()> { self.backend.commit() }

    pub fn rollback(&mut self) -> Result<()> { self.backend.rollback() }

    pub fn close(&mut self) -> Result<()> { self.backend.close() }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.backend.state().is_open() {
            if let Err(e) = self.backend.close() {
                warn!(db = %self.name, engine = self.backend.name(), error = %e, "close on drop failed");
            }
        }
    }
}
