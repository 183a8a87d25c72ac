use std::sync::Arc;
use std::time::Duration;

use search_model::{Condition, Direction, Document, FieldKind, Operator, Query, Result, Schema, SearchError, SortOrder, Value};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info, warn};

use crate::layout::{FieldLayout, PreparedDocument};
use crate::transport::{HttpTransport, Method, Response, Transport, ENGINE};
use crate::{page_window, ResultCursor, SearchBackend, SessionState};

const LOCK_DOC: &str = "writer";
const NDJSON: &str = "application/x-ndjson";

fn default_hosts() -> Vec<String> { vec!["http://localhost:9200".to_string()] }
fn default_timeout() -> u64 { 30 }
fn default_bulk_size() -> usize { 500 }
fn default_lock_ttl() -> u64 { 0 }

/// Connection parameters for an Elasticsearch-compatible cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticParams {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Buffered operations that trigger a bulk flush before commit.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    /// Age in seconds after which another writer may break a held lock.
    /// `0` keeps locks until released; a crashed writer's lock must then be
    /// removed with `DELETE <index>-write-lock/_doc/writer`.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for ElasticParams {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            timeout_secs: default_timeout(),
            bulk_size: default_bulk_size(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

/// Index names are lowercase and may not contain `/`.
pub fn index_name(name: &str) -> String { name.to_lowercase().replace('/', "_") }

pub struct ElasticBackend {
    index: String,
    lock_index: String,
    layout: FieldLayout,
    mapping: Json,
    transport: Arc<dyn Transport>,
    bulk_size: usize,
    lock_ttl: Option<Duration>,
    pending: Vec<String>,
    pending_ops: usize,
    flushed_in_session: bool,
    state: SessionState,
}

impl ElasticBackend {
    pub fn new(name: &str, schema: Arc<Schema>, params: ElasticParams) -> Result<Self> {
        let transport = HttpTransport::new(&params.hosts, Duration::from_secs(params.timeout_secs))?;
        let backend = Self::with_transport(name, schema, Arc::new(transport), params.bulk_size)?;
        Ok(match params.lock_ttl_secs {
            0 => backend,
            secs => backend.with_lock_ttl(Duration::from_secs(secs)),
        })
    }

    pub fn with_transport(name: &str, schema: Arc<Schema>, transport: Arc<dyn Transport>, bulk_size: usize) -> Result<Self> {
        let (mapping, layout) = Self::convert_schema(schema)?;
        let index = index_name(name);
        Ok(Self {
            lock_index: format!("{index}-write-lock"),
            index,
            layout,
            mapping,
            transport,
            bulk_size: bulk_size.max(1),
            lock_ttl: None,
            pending: Vec::new(),
            pending_ops: 0,
            flushed_in_session: false,
            state: SessionState::Closed,
        })
    }

    /// Let a writer break a lock document older than `ttl`.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Index-creation body: strict mapping with one property per field and shadow.
    pub fn convert_schema(schema: Arc<Schema>) -> Result<(Json, FieldLayout)> {
        let layout = FieldLayout::from_schema(schema)?;
        let mut properties = Map::new();
        for (name, field) in layout.schema().fields() {
            let ty = match field.kind {
                FieldKind::Numeric => "long",
                _ if field.is_tokenized() => "text",
                _ => "keyword",
            };
            properties.insert(name.to_string(), json!({ "type": ty, "store": field.stored }));
        }
        for (_, shadow) in &layout.shadows {
            properties.insert(shadow.clone(), json!({ "type": "keyword" }));
        }
        let mapping = json!({ "mappings": { "dynamic": "strict", "properties": properties } });
        Ok((mapping, layout))
    }

    pub fn index(&self) -> &str { &self.index }

    pub fn mapping(&self) -> &Json { &self.mapping }

    fn send(&self, method: Method, path: &str, body: Option<&str>) -> Result<Response> {
        self.transport.send(method, path, body, None)
    }

    fn ensure_index(&self) -> Result<()> {
        let path = format!("/{}", self.index);
        let head = self.send(Method::Head, &path, None)?;
        if head.is_success() {
            return Ok(());
        }
        if head.status != 404 {
            head.error_for_status("index lookup")?;
            return Ok(());
        }
        let body = self.mapping.to_string();
        let resp = self.send(Method::Put, &path, Some(&body))?;
        if resp.is_success() {
            info!(index = %self.index, "created elasticsearch index");
            Ok(())
        } else if resp.body.contains("resource_already_exists_exception") {
            Ok(())
        } else {
            resp.error_for_status("index creation").map(|_| ())
        }
    }

    fn acquire_lock(&self) -> Result<()> {
        if self.create_lock()? || (self.break_stale_lock()? && self.create_lock()?) {
            return Ok(());
        }
        Err(SearchError::LockConflict(format!("{} already has a writer", self.index)))
    }

    /// `false` when another lock document already exists.
    fn create_lock(&self) -> Result<bool> {
        let body = json!({
            "holder": format!("pid-{}", std::process::id()),
            "acquired_at": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        let path = format!("/{}/_create/{LOCK_DOC}?refresh=true", self.lock_index);
        let resp = self.send(Method::Put, &path, Some(&body))?;
        if resp.status == 409 {
            return Ok(false);
        }
        resp.error_for_status("write lock").map(|_| true)
    }

    /// Delete the lock document if it is older than the configured ttl.
    /// The delete is conditional on the sequence number read, so a lock
    /// taken in between survives.
    fn break_stale_lock(&self) -> Result<bool> {
        let Some(ttl) = self.lock_ttl else {
            return Ok(false);
        };
        let path = format!("/{}/_doc/{LOCK_DOC}", self.lock_index);
        let resp = self.send(Method::Get, &path, None)?;
        if resp.status == 404 {
            return Ok(true);
        }
        let found = resp.error_for_status("write lock lookup")?.json()?;
        let acquired = found["_source"]["acquired_at"]
            .as_str()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc));
        let Some(acquired) = acquired else {
            warn!(index = %self.index, "write lock has no readable acquired_at; leaving it");
            return Ok(false);
        };
        let age = chrono::Utc::now().signed_duration_since(acquired);
        if age.to_std().map_or(true, |age| age < ttl) {
            return Ok(false);
        }
        let (Some(seq_no), Some(term)) = (found["_seq_no"].as_u64(), found["_primary_term"].as_u64()) else {
            return Ok(false);
        };
        let path = format!("{path}?if_seq_no={seq_no}&if_primary_term={term}&refresh=true");
        let resp = self.send(Method::Delete, &path, None)?;
        match resp.status {
            404 | 409 => Ok(resp.status == 404),
            _ => {
                resp.error_for_status("stale write lock removal")?;
                warn!(
                    index = %self.index,
                    holder = found["_source"]["holder"].as_str().unwrap_or("unknown"),
                    age_secs = age.num_seconds(),
                    "broke stale write lock"
                );
                Ok(true)
            }
        }
    }

    fn release_lock(&self) -> Result<()> {
        let path = format!("/{}/_doc/{LOCK_DOC}?refresh=true", self.lock_index);
        let resp = self.send(Method::Delete, &path, None)?;
        if resp.status == 404 {
            warn!(index = %self.index, "write lock was already gone on release");
            return Ok(());
        }
        resp.error_for_status("write lock release").map(|_| ())
    }

    fn end_session(&mut self) {
        self.pending.clear();
        self.pending_ops = 0;
        self.flushed_in_session = false;
    }

    fn source(&self, prepared: &PreparedDocument) -> Json {
        let mut body = Map::new();
        for (name, value) in &prepared.values {
            let v = match value {
                Value::Integer(i) => json!(i),
                Value::Text(s) => json!(s),
            };
            body.insert(name.clone(), v);
        }
        Json::Object(body)
    }

    fn push_op(&mut self, action: Json, source: Option<Json>) -> Result<()> {
        self.pending.push(action.to_string());
        if let Some(source) = source {
            self.pending.push(source.to_string());
        }
        self.pending_ops += 1;
        if self.pending_ops >= self.bulk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn push_delete(&mut self, id: &str) -> Result<()> {
        let action = json!({ "delete": { "_index": self.index, "_id": id } });
        self.push_op(action, None)
    }

    fn push_index(&mut self, prepared: &PreparedDocument) -> Result<()> {
        let action = match &prepared.id {
            Some(id) => json!({ "index": { "_index": self.index, "_id": id } }),
            None => json!({ "index": { "_index": self.index } }),
        };
        let source = self.source(prepared);
        self.push_op(action, Some(source))
    }

    /// Send buffered operations as one `_bulk` request.
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut body = self.pending.join("\n");
        body.push('\n');
        let ops = self.pending_ops;
        self.pending.clear();
        self.pending_ops = 0;
        self.flushed_in_session = true;

        let resp = self.transport.send(Method::Post, "/_bulk", Some(&body), Some(NDJSON))?.error_for_status("bulk")?;
        let json = resp.json()?;
        if json.get("errors").and_then(Json::as_bool).unwrap_or(false) {
            let reason = json
                .get("items")
                .and_then(Json::as_array)
                .into_iter()
                .flatten()
                .filter_map(|item| item.as_object()?.values().next()?.get("error").cloned())
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown bulk failure".into());
            return Err(SearchError::engine(ENGINE, format!("bulk request rejected: {reason}")));
        }
        debug!(index = %self.index, ops, "elasticsearch bulk flush");
        Ok(())
    }

    fn translate_condition(&self, condition: &Condition) -> Result<Option<String>> {
        let Some(field) = self.layout.schema().get(&condition.field) else {
            return Err(SearchError::SchemaViolation(format!("query references unknown field {}", condition.field)));
        };
        let name = if field.kind == FieldKind::Identifier { "_id" } else { condition.field.as_str() };
        if field.kind == FieldKind::Numeric {
            let v = condition.value.as_integer().ok_or_else(|| {
                SearchError::InvalidQuery(format!("{} expects an integer, got {}", condition.field, condition.value))
            })?;
            return Ok(Some(match condition.operator {
                Operator::Contains => format!("{name}:{v}"),
                op => format!("{name}:{}{v}", op.symbol()),
            }));
        }
        let text = condition.value.to_string();
        Ok(match condition.operator {
            Operator::Contains if field.is_tokenized() => {
                let words: Vec<String> = text.split_whitespace().map(quote).collect();
                match words.len() {
                    0 => None,
                    1 => Some(format!("{name}:{}", words[0])),
                    _ => Some(format!("{name}:({})", words.join(" AND "))),
                }
            }
            Operator::Contains => Some(format!("{name}:{}", quote(&text))),
            Operator::Gt => Some(format!("{name}:{{{} TO *]", quote(&text))),
            Operator::Ge => Some(format!("{name}:[{} TO *]", quote(&text))),
            Operator::Lt => Some(format!("{name}:[* TO {}}}", quote(&text))),
            Operator::Le => Some(format!("{name}:[* TO {}]", quote(&text))),
        })
    }

    /// `query_string` text for `query`, or `None` for match-all.
    pub fn compile(&self, query: &Query) -> Result<Option<String>> {
        // validate first so the infallible renderer only sees good conditions
        for condition in query.walk() {
            self.translate_condition(condition)?;
        }
        let rendered = query.render(&mut |c| self.translate_condition(c).ok().flatten());
        Ok(if rendered.trim().is_empty() { None } else { Some(rendered) })
    }

    /// Search request body for one page.
    pub fn search_body(&self, query: Option<&str>, sort: &[(String, Direction)], from: usize, size: usize) -> Json {
        let query = match query {
            Some(q) => json!({ "query_string": { "query": q } }),
            None => json!({ "match_all": {} }),
        };
        let mut body = json!({
            "query": query,
            "from": from,
            "size": size,
            "track_total_hits": true,
            "_source": self.layout.stored,
        });
        if !sort.is_empty() {
            let sort: Vec<Json> = sort
                .iter()
                .map(|(field, dir)| {
                    let order = match dir {
                        Direction::Asc => "asc",
                        Direction::Desc => "desc",
                    };
                    let mut key = Map::new();
                    key.insert(field.clone(), json!({ "order": order }));
                    Json::Object(key)
                })
                .collect();
            body["sort"] = Json::Array(sort);
        }
        body
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

impl SearchBackend for ElasticBackend {
    fn name(&self) -> &'static str { ENGINE }
    fn schema(&self) -> &Schema { self.layout.schema() }
    fn state(&self) -> SessionState { self.state }

    fn open(&mut self, write: bool) -> Result<()> {
        if self.state == SessionState::Closed {
            self.state = SessionState::Read;
        }
        if write && self.state != SessionState::Write {
            self.ensure_index()?;
            self.acquire_lock()?;
            debug!(index = %self.index, "elasticsearch write session opened");
            self.state = SessionState::Write;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Write {
            if self.pending_ops > 0 || self.flushed_in_session {
                warn!(index = %self.index, pending = self.pending_ops, "closing elasticsearch index with uncommitted writes; buffered operations are discarded");
            }
            self.end_session();
            self.state = SessionState::Closed;
            return self.release_lock();
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.require_write("commit")?;
        self.flush()?;
        self.send(Method::Post, &format!("/{}/_refresh", self.index), None)?
            .error_for_status("refresh")?;
        self.end_session();
        self.release_lock()?;
        debug!(index = %self.index, "elasticsearch commit");
        self.state = SessionState::Read;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.require_write("rollback")?;
        if self.flushed_in_session {
            warn!(index = %self.index, "rollback cannot undo operations already sent in bulk");
        }
        self.end_session();
        self.release_lock()?;
        debug!(index = %self.index, "elasticsearch rollback");
        self.state = SessionState::Read;
        Ok(())
    }

    fn add(&mut self, doc: &Document) -> Result<()> {
        let prepared = self.layout.prepare(doc)?;
        self.open(true)?;
        self.push_index(&prepared)
    }

    fn replace(&mut self, id: &str, doc: &Document) -> Result<()> {
        if self.layout.identifier.is_none() {
            return Err(SearchError::SchemaViolation("replace requires an identifier field".into()));
        }
        let prepared = self.layout.prepare(doc)?;
        self.open(true)?;
        if prepared.id.as_deref() != Some(id) {
            self.push_delete(id)?;
        }
        self.push_index(&prepared)
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        if self.layout.identifier.is_none() {
            return Err(SearchError::SchemaViolation("remove requires an identifier field".into()));
        }
        self.open(true)?;
        self.push_delete(id)
    }

    fn find<'a>(&'a mut self, query: &Query, order: &SortOrder) -> Result<Box<dyn ResultCursor + 'a>> {
        let sort = self.layout.sort_targets(order)?;
        let compiled = self.compile(query)?;
        self.open(false)?;
        debug!(index = %self.index, query = ?compiled, "elasticsearch find");
        Ok(Box::new(ElasticCursor { backend: self, query: compiled, sort, total: None }))
    }
}

pub struct ElasticCursor<'a> {
    backend: &'a ElasticBackend,
    query: Option<String>,
    sort: Vec<(String, Direction)>,
    total: Option<u64>,
}

impl ElasticCursor<'_> {
    fn restore(&self, source: &Json) -> Document {
        let values = source.as_object().into_iter().flatten().filter_map(|(name, v)| {
            let value = match v {
                Json::Number(n) => Value::Integer(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?),
                Json::String(s) => Value::Text(s.clone()),
                _ => return None,
            };
            Some((name.clone(), value))
        });
        self.backend.layout.restore(values.collect::<Vec<_>>())
    }
}

impl ResultCursor for ElasticCursor<'_> {
    fn page(&mut self, page: usize, page_size: usize) -> Result<Vec<Document>> {
        let (from, size) = page_window(page, page_size)?;
        let backend = self.backend;
        let body = backend.search_body(self.query.as_deref(), &self.sort, from, size).to_string();
        let resp = backend.send(Method::Post, &format!("/{}/_search", backend.index), Some(&body))?;
        if resp.status == 404 {
            // index never written
            self.total = Some(0);
            return Ok(Vec::new());
        }
        let json = resp.error_for_status("search")?.json()?;
        let hits = &json["hits"];
        let total = match &hits["total"] {
            Json::Number(n) => n.as_u64(),
            other => other.get("value").and_then(Json::as_u64),
        };
        self.total = Some(total.unwrap_or(0));
        Ok(hits["hits"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|hit| self.restore(&hit["_source"]))
            .collect())
    }

    fn total_rows(&self) -> Option<u64> { self.total }
}
