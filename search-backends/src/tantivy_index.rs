use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use search_model::{Condition, Conjunction, Direction, Document, FieldKind, Operator, Query, Result, Schema, SearchError, SortOrder, Value};
use serde::{Deserialize, Serialize};
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::directory::error::LockError;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, EmptyQuery, Occur, Query as TantivyQuery, RangeQuery, TermQuery};
use tantivy::schema::document::TantivyDocument;
use tantivy::schema::Value as _;
use tantivy::schema::{Field as TantivyField, IndexRecordOption, NumericOptions, Schema as TantivySchema, TextOptions, STRING, TEXT};
use tantivy::tokenizer::TokenStream;
use tantivy::{DocAddress, DocId, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyError, Term};
use tracing::{debug, info, warn};

use crate::layout::{FieldLayout, PreparedDocument};
use crate::{page_window, EmptyCursor, ResultCursor, SearchBackend, SessionState};

const ENGINE: &str = "tantivy";

fn default_writer_memory() -> usize { 50_000_000 }

/// Connection parameters for the embedded segment-file engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TantivyParams {
    /// Root directory; each logical database gets `<index_dir>/<name>`.
    pub index_dir: PathBuf,
    /// Overall indexing memory budget handed to the index writer.
    #[serde(default = "default_writer_memory")]
    pub writer_memory_bytes: usize,
}

impl TantivyParams {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self { index_dir: index_dir.into(), writer_memory_bytes: default_writer_memory() }
    }
}

/// Tantivy-backed adapter over an mmap directory.
pub struct TantivyBackend {
    path: PathBuf,
    layout: FieldLayout,
    native: TantivySchema,
    fields: HashMap<String, TantivyField>,
    writer_memory: usize,
    index: Option<Index>,
    reader: Option<IndexReader>,
    writer: Option<IndexWriter>,
    state: SessionState,
}

impl TantivyBackend {
    pub fn new(name: &str, schema: Arc<Schema>, params: TantivyParams) -> Result<Self> {
        let (native, layout) = Self::convert_schema(schema)?;
        let fields = native
            .fields()
            .map(|(field, entry)| (entry.name().to_string(), field))
            .collect();
        Ok(Self {
            path: params.index_dir.join(name),
            layout,
            native,
            fields,
            writer_memory: params.writer_memory_bytes,
            index: None,
            reader: None,
            writer: None,
            state: SessionState::Closed,
        })
    }

    /// Translate the unified schema into a Tantivy schema plus derived layout.
    pub fn convert_schema(schema: Arc<Schema>) -> Result<(TantivySchema, FieldLayout)> {
        let layout = FieldLayout::from_schema(schema)?;
        let mut builder = TantivySchema::builder();
        for (name, field) in layout.schema().fields() {
            if field.kind == FieldKind::Numeric {
                let mut opts = NumericOptions::default().set_indexed().set_fast();
                if field.stored {
                    opts = opts.set_stored();
                }
                builder.add_i64_field(name, opts);
                continue;
            }
            let mut opts: TextOptions = if field.is_tokenized() { TEXT } else { STRING };
            if field.stored {
                opts = opts.set_stored();
            }
            // sortable text without a shadow is the raw identifier
            if field.sortable && !field.has_sort_shadow() {
                opts = opts.set_fast(None);
            }
            builder.add_text_field(name, opts);
        }
        for (_, shadow) in &layout.shadows {
            builder.add_text_field(shadow, STRING.set_fast(None));
        }
        Ok((builder.build(), layout))
    }

    pub fn path(&self) -> &Path { &self.path }

    fn index_exists(&self) -> bool { self.path.join("meta.json").exists() }

    /// Attach to the on-disk index, creating it when `create` is set.
    /// Returns false when the index is absent and was not created.
    fn attach(&mut self, create: bool) -> Result<bool> {
        if self.index.is_some() {
            return Ok(true);
        }
        let exists = self.index_exists();
        if !exists && !create {
            return Ok(false);
        }
        if !exists {
            fs::create_dir_all(&self.path).map_err(|e| SearchError::BackendUnavailable(format!("{}: {e}", self.path.display())))?;
            info!(path = %self.path.display(), "creating tantivy index");
        }
        let dir = MmapDirectory::open(&self.path).map_err(|e| map_err(TantivyError::from(e)))?;
        // never recreates: an existing index with a different schema is an error
        let index = Index::open_or_create(dir, self.native.clone()).map_err(map_err)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(map_err)?;
        self.index = Some(index);
        self.reader = Some(reader);
        Ok(true)
    }

    fn writer_mut(&mut self) -> Result<&mut IndexWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| SearchError::InvalidState("no tantivy writer is open".into()))
    }

    fn to_native(&self, prepared: &PreparedDocument) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        for (name, value) in &prepared.values {
            let Some(&field) = self.fields.get(name) else { continue };
            match value {
                Value::Integer(v) => doc.add_i64(field, *v),
                Value::Text(s) => doc.add_text(field, s),
            }
        }
        doc
    }

    fn id_field(&self) -> Option<TantivyField> {
        self.layout.identifier.as_ref().and_then(|name| self.fields.get(name).copied())
    }

    fn write_prepared(&mut self, prepared: PreparedDocument, also_delete: Option<&str>) -> Result<()> {
        self.open(true)?;
        let native = self.to_native(&prepared);
        let id_field = self.id_field();
        let writer = self.writer_mut()?;
        if let Some(id_field) = id_field {
            for id in also_delete.into_iter().chain(prepared.id.as_deref()) {
                writer.delete_term(Term::from_field_text(id_field, id));
            }
        }
        writer.add_document(native).map_err(map_err)?;
        Ok(())
    }

    fn translate_condition(&self, index: &Index, condition: &Condition) -> Result<Option<Box<dyn TantivyQuery>>> {
        let decl = self.layout.schema().get(&condition.field).ok_or_else(|| {
            SearchError::SchemaViolation(format!("query references unknown field {}", condition.field))
        })?;
        let field = self.fields[&condition.field];
        let query: Box<dyn TantivyQuery> = if decl.kind == FieldKind::Numeric {
            let value = condition.value.as_integer().ok_or_else(|| {
                SearchError::InvalidQuery(format!("{} expects an integer, got {}", condition.field, condition.value))
            })?;
            let term = Term::from_field_i64(field, value);
            match condition.operator {
                Operator::Contains => Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
                op => range_query(op, term),
            }
        } else {
            let text = condition.value.to_string();
            match condition.operator {
                Operator::Contains if decl.is_tokenized() => token_query(index, field, &text)?,
                Operator::Contains => Box::new(TermQuery::new(Term::from_field_text(field, &text), IndexRecordOption::Basic)),
                op => range_query(op, Term::from_field_text(field, &text)),
            }
        };
        Ok(Some(query))
    }

    fn compile(&self, index: &Index, query: &Query) -> Result<Box<dyn TantivyQuery>> {
        let compiled = query.compile(
            &mut |c| self.translate_condition(index, c),
            &mut |conjunction, items: Vec<Box<dyn TantivyQuery>>| {
                let occur = match conjunction {
                    Conjunction::And => Occur::Must,
                    Conjunction::Or => Occur::Should,
                };
                let clauses: Vec<(Occur, Box<dyn TantivyQuery>)> = items.into_iter().map(|q| (occur, q)).collect();
                Box::new(BooleanQuery::from(clauses)) as Box<dyn TantivyQuery>
            },
        )?;
        Ok(compiled.unwrap_or_else(|| Box::new(AllQuery)))
    }
}

impl SearchBackend for TantivyBackend {
    fn name(&self) -> &'static str { ENGINE }
    fn schema(&self) -> &Schema { self.layout.schema() }
    fn state(&self) -> SessionState { self.state }

    fn open(&mut self, write: bool) -> Result<()> {
        self.attach(write)?;
        if self.state == SessionState::Closed {
            self.state = SessionState::Read;
        }
        if write && self.writer.is_none() {
            let index = self
                .index
                .as_ref()
                .ok_or_else(|| SearchError::InvalidState("tantivy index is not attached".into()))?;
            let writer: IndexWriter = index.writer(self.writer_memory).map_err(|e| match e {
                TantivyError::LockFailure(LockError::LockBusy, _) => {
                    SearchError::LockConflict(format!("{} already has a writer", self.path.display()))
                }
                other => map_err(other),
            })?;
            debug!(path = %self.path.display(), "tantivy write session opened");
            self.writer = Some(writer);
            self.state = SessionState::Write;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.writer.take().is_some() {
            warn!(path = %self.path.display(), "closing tantivy index with uncommitted writes; they are discarded");
        }
        self.reader = None;
        self.index = None;
        self.state = SessionState::Closed;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.require_write("commit")?;
        let mut writer = self.writer.take().ok_or_else(|| SearchError::InvalidState("no tantivy writer is open".into()))?;
        writer.commit().map_err(map_err)?;
        drop(writer);
        if let Some(reader) = &self.reader {
            reader.reload().map_err(map_err)?;
        }
        debug!(path = %self.path.display(), "tantivy commit");
        self.state = SessionState::Read;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.require_write("rollback")?;
        if let Some(mut writer) = self.writer.take() {
            writer.rollback().map_err(map_err)?;
        }
        debug!(path = %self.path.display(), "tantivy rollback");
        self.state = SessionState::Read;
        Ok(())
    }

    fn add(&mut self, doc: &Document) -> Result<()> {
        let prepared = self.layout.prepare(doc)?;
        self.write_prepared(prepared, None)
    }

    fn replace(&mut self, id: &str, doc: &Document) -> Result<()> {
        if self.layout.identifier.is_none() {
            return Err(SearchError::SchemaViolation("replace requires an identifier field".into()));
        }
        let prepared = self.layout.prepare(doc)?;
        self.write_prepared(prepared, Some(id))
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        let Some(id_field) = self.id_field() else {
            return Err(SearchError::SchemaViolation("remove requires an identifier field".into()));
        };
        self.open(true)?;
        self.writer_mut()?.delete_term(Term::from_field_text(id_field, id));
        Ok(())
    }

    fn find<'a>(&'a mut self, query: &Query, order: &SortOrder) -> Result<Box<dyn ResultCursor + 'a>> {
        let sort = self.layout.sort_targets(order)?;
        self.open(false)?;
        let this: &'a TantivyBackend = self;
        let (Some(index), Some(reader)) = (&this.index, &this.reader) else {
            return Ok(Box::new(EmptyCursor::default()));
        };
        let compiled = this.compile(index, query)?;
        debug!(query = ?compiled, "tantivy find");
        Ok(Box::new(TantivyCursor {
            backend: this,
            reader: reader.clone(),
            query: compiled,
            sort,
            total: None,
        }))
    }
}

/// Cursor over one compiled Tantivy query.
pub struct TantivyCursor<'a> {
    backend: &'a TantivyBackend,
    reader: IndexReader,
    query: Box<dyn TantivyQuery>,
    sort: Vec<(String, Direction)>,
    total: Option<u64>,
}

/// Values compare before text; missing values sort last ascending.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Int(i64),
    Text(String),
    Missing,
}

impl TantivyCursor<'_> {
    fn sorted_window(&self, searcher: &tantivy::Searcher, offset: usize, limit: usize) -> Result<(usize, Vec<DocAddress>)> {
        let matched = searcher.search(&*self.query, &DocSetCollector).map_err(map_err)?;
        let total = matched.len();
        let mut by_segment: BTreeMap<u32, Vec<DocId>> = BTreeMap::new();
        for addr in matched {
            by_segment.entry(addr.segment_ord).or_default().push(addr.doc_id);
        }

        let mut keyed: Vec<(Vec<SortKey>, DocAddress)> = Vec::with_capacity(total);
        for (segment_ord, docs) in by_segment {
            let fast = searcher.segment_reader(segment_ord).fast_fields();
            let mut keys: Vec<Vec<SortKey>> = vec![Vec::with_capacity(self.sort.len()); docs.len()];
            for (name, _) in &self.sort {
                if self.backend.layout.is_numeric(name) {
                    let column = fast.i64(name).map_err(map_err)?;
                    for (slot, doc) in keys.iter_mut().zip(&docs) {
                        slot.push(column.first(*doc).map(SortKey::Int).unwrap_or(SortKey::Missing));
                    }
                } else {
                    let column = fast.str(name).map_err(map_err)?;
                    for (slot, doc) in keys.iter_mut().zip(&docs) {
                        let mut key = SortKey::Missing;
                        if let Some(column) = &column {
                            if let Some(ord) = column.term_ords(*doc).next() {
                                let mut text = String::new();
                                column
                                    .ord_to_str(ord, &mut text)
                                    .map_err(|e| SearchError::BackendUnavailable(e.to_string()))?;
                                key = SortKey::Text(text);
                            }
                        }
                        slot.push(key);
                    }
                }
            }
            for (key, doc) in keys.into_iter().zip(docs) {
                keyed.push((key, DocAddress::new(segment_ord, doc)));
            }
        }

        keyed.sort_by(|(ka, a), (kb, b)| {
            for (i, (_, dir)) in self.sort.iter().enumerate() {
                let ord = ka[i].cmp(&kb[i]);
                let ord = if *dir == Direction::Desc { ord.reverse() } else { ord };
                if ord.is_ne() {
                    return ord;
                }
            }
            (a.segment_ord, a.doc_id).cmp(&(b.segment_ord, b.doc_id))
        });
        Ok((total, keyed.into_iter().skip(offset).take(limit).map(|(_, a)| a).collect()))
    }

    fn restore(&self, doc: &TantivyDocument) -> Document {
        let backend = self.backend;
        let values = backend.layout.stored.iter().filter_map(|name| {
            let field = *backend.fields.get(name)?;
            let value = doc.get_first(field)?;
            let value = match value.as_i64() {
                Some(v) => Value::Integer(v),
                None => Value::Text(value.as_str()?.to_string()),
            };
            Some((name.clone(), value))
        });
        backend.layout.restore(values.collect::<Vec<_>>())
    }
}

impl ResultCursor for TantivyCursor<'_> {
    fn page(&mut self, page: usize, page_size: usize) -> Result<Vec<Document>> {
        let (offset, limit) = page_window(page, page_size)?;
        self.reader.reload().map_err(map_err)?;
        // searcher is scoped to this call
        let searcher = self.reader.searcher();
        let (total, addresses) = if !self.sort.is_empty() {
            self.sorted_window(&searcher, offset, limit)?
        } else if limit == 0 {
            (searcher.search(&*self.query, &Count).map_err(map_err)?, Vec::new())
        } else {
            let collector = (Count, TopDocs::with_limit(limit).and_offset(offset));
            let (count, top) = searcher.search(&*self.query, &collector).map_err(map_err)?;
            (count, top.into_iter().map(|(_, addr)| addr).collect())
        };
        self.total = Some(total as u64);

        let mut out = Vec::with_capacity(addresses.len());
        for addr in addresses {
            let doc: TantivyDocument = searcher.doc(addr).map_err(map_err)?;
            out.push(self.restore(&doc));
        }
        Ok(out)
    }

    fn total_rows(&self) -> Option<u64> { self.total }
}

fn range_query(op: Operator, term: Term) -> Box<dyn TantivyQuery> {
    let (lower, upper) = match op {
        Operator::Gt => (Bound::Excluded(term), Bound::Unbounded),
        Operator::Ge => (Bound::Included(term), Bound::Unbounded),
        Operator::Lt => (Bound::Unbounded, Bound::Excluded(term)),
        Operator::Le => (Bound::Unbounded, Bound::Included(term)),
        Operator::Contains => (Bound::Included(term.clone()), Bound::Included(term)),
    };
    Box::new(RangeQuery::new(lower, upper))
}

/// All tokens of `text` under the field's analyzer must match.
fn token_query(index: &Index, field: TantivyField, text: &str) -> Result<Box<dyn TantivyQuery>> {
    let mut analyzer = index.tokenizer_for_field(field).map_err(map_err)?;
    let mut stream = analyzer.token_stream(text);
    let mut terms = Vec::new();
    while stream.advance() {
        terms.push(Term::from_field_text(field, &stream.token().text));
    }
    Ok(match terms.len() {
        0 => Box::new(EmptyQuery),
        1 => Box::new(TermQuery::new(terms.remove(0), IndexRecordOption::WithFreqs)),
        _ => {
            let clauses: Vec<(Occur, Box<dyn TantivyQuery>)> = terms
                .into_iter()
                .map(|t| (Occur::Must, Box::new(TermQuery::new(t, IndexRecordOption::WithFreqs)) as Box<dyn TantivyQuery>))
                .collect();
            Box::new(BooleanQuery::from(clauses))
        }
    })
}

fn map_err(e: TantivyError) -> SearchError {
    match e {
        TantivyError::LockFailure(LockError::LockBusy, msg) => {
            SearchError::LockConflict(msg.unwrap_or_else(|| "index writer lock is busy".into()))
        }
        TantivyError::IoError(io) => SearchError::BackendUnavailable(io.to_string()),
        other => SearchError::engine(ENGINE, other.to_string()),
    }
}
