use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use search_model::{
    Condition, Conjunction, Direction, Document, FieldKind, Query, RangeSet, Result, Schema, SearchError, SortOrder, Value,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::layout::FieldLayout;
use crate::sqlite_repo::{from_sql, map_err, quote, to_sql, SqliteRepo, SqliteTable, DOCUMENTS_TABLE, ENGINE, FTS_TABLE};
use crate::{page_window, EmptyCursor, ResultCursor, SearchBackend, SessionState};

const DB_FILE: &str = "index.sqlite3";

/// Connection parameters for the embedded FTS5 engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteParams {
    /// Root directory; each logical database gets `<index_dir>/<name>/index.sqlite3`.
    pub index_dir: PathBuf,
}

impl SqliteParams {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self { Self { index_dir: index_dir.into() } }
}

/// SQLite FTS5 adapter. Tokenized text conditions go to `MATCH`, other
/// equalities compare content-table columns, and range comparators are
/// deferred into `WHERE` filters.
pub struct SqliteBackend {
    dir: PathBuf,
    layout: FieldLayout,
    table: SqliteTable,
    repo: Option<SqliteRepo>,
    state: SessionState,
}

/// A query compiled into a `WHERE` predicate tree plus the deferred range
/// filters. Tokenized text conditions become FTS5 `MATCH` sub-selects inside
/// the tree; `rank_expr` ORs them together for bm25 ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub filter: Option<Predicate>,
    pub rank_expr: Option<String>,
    pub ranges: RangeSet,
}

/// SQL boolean expression over the content table `d` with its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Predicate {
    fn combine(conjunction: Conjunction, parts: Vec<Predicate>) -> Predicate {
        let op = match conjunction {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        };
        let mut sql = Vec::with_capacity(parts.len());
        let mut params = Vec::new();
        for part in parts {
            sql.push(part.sql);
            params.extend(part.params);
        }
        Predicate { sql: format!("({})", sql.join(op)), params }
    }
}

impl SqliteBackend {
    pub fn new(name: &str, schema: Arc<Schema>, params: SqliteParams) -> Result<Self> {
        let (table, layout) = Self::convert_schema(schema)?;
        Ok(Self { dir: params.index_dir.join(name), layout, table, repo: None, state: SessionState::Closed })
    }

    pub fn convert_schema(schema: Arc<Schema>) -> Result<(SqliteTable, FieldLayout)> {
        let layout = FieldLayout::from_schema(schema)?;
        let table = SqliteTable::from_layout(&layout)?;
        Ok((table, layout))
    }

    pub fn db_path(&self) -> PathBuf { self.dir.join(DB_FILE) }

    pub fn dir(&self) -> &Path { &self.dir }

    fn repo(&self) -> Result<&SqliteRepo> {
        self.repo.as_ref().ok_or_else(|| SearchError::InvalidState("sqlite index is not open".into()))
    }

    /// Compile `query` into a predicate tree and a fresh [`RangeSet`].
    pub fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        for condition in query.walk() {
            self.check_condition(condition)?;
        }
        let mut ranges = RangeSet::new();
        let mut rank_terms = Vec::new();
        let filter = query.compile(
            &mut |c| Ok(self.translate_condition(c, &mut ranges, &mut rank_terms)),
            &mut Predicate::combine,
        )?;
        let rank_expr = match rank_terms.len() {
            0 => None,
            1 => rank_terms.pop(),
            _ => Some(rank_terms.iter().map(|t| format!("({t})")).collect::<Vec<_>>().join(" OR ")),
        };
        Ok(CompiledQuery { filter, rank_expr, ranges })
    }

    fn check_condition(&self, condition: &Condition) -> Result<()> {
        let Some(field) = self.layout.schema().get(&condition.field) else {
            return Err(SearchError::SchemaViolation(format!("query references unknown field {}", condition.field)));
        };
        if field.kind == FieldKind::Numeric && condition.value.as_integer().is_none() {
            return Err(SearchError::InvalidQuery(format!(
                "{} expects an integer, got {}",
                condition.field, condition.value
            )));
        }
        Ok(())
    }

    fn translate_condition(
        &self,
        condition: &Condition,
        ranges: &mut RangeSet,
        rank_terms: &mut Vec<String>,
    ) -> Option<Predicate> {
        if condition.operator.is_range() {
            ranges.absorb(condition);
            return None;
        }
        let column = format!("d.{}", quote(&condition.field));
        let tokenized = self.layout.schema().get(&condition.field).is_some_and(|f| f.is_tokenized());
        if !tokenized {
            let param = bound_param(&condition.value, self.layout.is_numeric(&condition.field));
            return Some(Predicate { sql: format!("{column} = ?"), params: vec![param] });
        }
        let words: Vec<String> = condition
            .value
            .to_string()
            .split_whitespace()
            .map(|w| format!("{} : \"{}\"", condition.field, w.replace('"', "\"\"")))
            .collect();
        if words.is_empty() {
            return None;
        }
        let expr = words.join(" AND ");
        rank_terms.push(expr.clone());
        Some(Predicate {
            sql: format!("d.rowid IN (SELECT rowid FROM {FTS_TABLE} WHERE {FTS_TABLE} MATCH ?)"),
            params: vec![SqlValue::Text(expr)],
        })
    }

    fn insert(&mut self, doc: &Document, replaced: Option<&str>) -> Result<()> {
        let prepared = self.layout.prepare(doc)?;
        self.open(true)?;
        let repo = self.repo()?;
        if let Some(id_col) = &self.layout.identifier {
            for id in replaced.into_iter().chain(prepared.id.as_deref()) {
                repo.delete_by_key(id_col, id)?;
            }
        }
        repo.insert(&self.table, &prepared)
    }
}

impl SearchBackend for SqliteBackend {
    fn name(&self) -> &'static str { ENGINE }
    fn schema(&self) -> &Schema { self.layout.schema() }
    fn state(&self) -> SessionState { self.state }

    fn open(&mut self, write: bool) -> Result<()> {
        if self.repo.is_none() {
            let path = self.db_path();
            if !write && !path.exists() {
                self.state = SessionState::Read;
                return Ok(());
            }
            fs::create_dir_all(&self.dir)
                .map_err(|e| SearchError::BackendUnavailable(format!("{}: {e}", self.dir.display())))?;
            self.repo = Some(SqliteRepo::open(&path)?);
        }
        if self.state == SessionState::Closed {
            self.state = SessionState::Read;
        }
        if write && self.state != SessionState::Write {
            let repo = self.repo()?;
            repo.begin_immediate()?;
            let created = if repo.has_documents_table()? {
                Ok(false)
            } else {
                repo.create_tables(&self.table).map(|_| true)
            };
            match created {
                Ok(true) => info!(path = %repo.path().display(), "created sqlite index tables"),
                Ok(false) => {}
                Err(e) => {
                    let _ = repo.rollback();
                    return Err(e);
                }
            }
            debug!(path = %repo.path().display(), "sqlite write session opened");
            self.state = SessionState::Write;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Write {
            warn!(path = %self.db_path().display(), "closing sqlite index with uncommitted writes; they are discarded");
            self.repo()?.rollback()?;
        }
        self.repo = None;
        self.state = SessionState::Closed;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.require_write("commit")?;
        self.repo()?.commit()?;
        debug!(path = %self.db_path().display(), "sqlite commit");
        self.state = SessionState::Read;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.require_write("rollback")?;
        self.repo()?.rollback()?;
        debug!(path = %self.db_path().display(), "sqlite rollback");
        self.state = SessionState::Read;
        Ok(())
    }

    fn add(&mut self, doc: &Document) -> Result<()> { self.insert(doc, None) }

    fn replace(&mut self, id: &str, doc: &Document) -> Result<()> {
        if self.layout.identifier.is_none() {
            return Err(SearchError::SchemaViolation("replace requires an identifier field".into()));
        }
        self.insert(doc, Some(id))
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        let Some(id_col) = self.layout.identifier.clone() else {
            return Err(SearchError::SchemaViolation("remove requires an identifier field".into()));
        };
        self.open(true)?;
        let n = self.repo()?.delete_by_key(&id_col, id)?;
        debug!(id, removed = n, "sqlite remove");
        Ok(())
    }

    fn find<'a>(&'a mut self, query: &Query, order: &SortOrder) -> Result<Box<dyn ResultCursor + 'a>> {
        let sort = self.layout.sort_targets(order)?;
        let compiled = self.compile(query)?;
        self.open(false)?;
        let this: &'a SqliteBackend = self;
        let Some(repo) = &this.repo else {
            return Ok(Box::new(EmptyCursor::default()));
        };
        if !repo.has_documents_table()? {
            return Ok(Box::new(EmptyCursor::default()));
        }
        let ranked = sort.is_empty() && compiled.rank_expr.is_some();
        debug!(filter = ?compiled.filter.as_ref().map(|p| &p.sql), ranges = compiled.ranges.len(), ranked, "sqlite find");
        let (from_where, params) = this.from_where(&compiled, ranked);
        Ok(Box::new(SqliteCursor {
            repo,
            layout: &this.layout,
            from_where,
            params,
            order_by: order_by(&sort, ranked),
            total: None,
        }))
    }
}

impl SqliteBackend {
    /// `FROM ... WHERE ...` shared by the count and page statements. Range
    /// filters are ANDed onto the predicate tree once.
    fn from_where(&self, compiled: &CompiledQuery, ranked: bool) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut sql = format!("FROM {DOCUMENTS_TABLE} d");
        if let (true, Some(expr)) = (ranked, &compiled.rank_expr) {
            sql.push_str(&format!(
                " LEFT JOIN (SELECT rowid AS hit, bm25({FTS_TABLE}) AS score FROM {FTS_TABLE} WHERE {FTS_TABLE} MATCH ?) r \
                 ON r.hit = d.rowid"
            ));
            params.push(SqlValue::Text(expr.clone()));
        }
        match &compiled.filter {
            Some(filter) => {
                sql.push_str(&format!(" WHERE {}", filter.sql));
                params.extend(filter.params.iter().cloned());
            }
            None => sql.push_str(" WHERE 1 = 1"),
        }
        for (field, interval) in compiled.ranges.iter() {
            let column = format!("d.{}", quote(field));
            let numeric = self.layout.is_numeric(field);
            for (bound, incl, excl) in [(&interval.start, ">=", ">"), (&interval.end, "<=", "<")] {
                let (op, value) = match bound {
                    Bound::Included(v) => (incl, v),
                    Bound::Excluded(v) => (excl, v),
                    Bound::Unbounded => continue,
                };
                sql.push_str(&format!(" AND {column} {op} ?"));
                params.push(bound_param(value, numeric));
            }
        }
        (sql, params)
    }
}

fn bound_param(value: &Value, numeric: bool) -> SqlValue {
    match (numeric, value.as_integer()) {
        (true, Some(v)) => SqlValue::Integer(v),
        _ => to_sql(&Value::Text(value.to_string())),
    }
}

fn order_by(sort: &[(String, Direction)], ranked: bool) -> String {
    let mut keys: Vec<String> = sort
        .iter()
        .map(|(col, dir)| {
            let dir = match dir {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            format!("d.{} {dir}", quote(col))
        })
        .collect();
    if ranked {
        // bm25 is negative with better matches lower; unranked rows go last
        keys.push("r.score IS NULL".into());
        keys.push("r.score".into());
    }
    keys.push("d.rowid".into());
    keys.join(", ")
}

/// Cursor re-running one compiled statement per page.
pub struct SqliteCursor<'a> {
    repo: &'a SqliteRepo,
    layout: &'a FieldLayout,
    from_where: String,
    params: Vec<SqlValue>,
    order_by: String,
    total: Option<u64>,
}

impl ResultCursor for SqliteCursor<'_> {
    fn page(&mut self, page: usize, page_size: usize) -> Result<Vec<Document>> {
        let (offset, limit) = page_window(page, page_size)?;
        let conn = self.repo.conn();

        let count_sql = format!("SELECT count(*) {}", self.from_where);
        let total: i64 = conn
            .query_row(&count_sql, rusqlite::params_from_iter(self.params.iter()), |r| r.get(0))
            .map_err(map_err)?;
        self.total = Some(total.max(0) as u64);

        let columns: Vec<String> = if self.layout.stored.is_empty() {
            vec!["d.rowid".into()]
        } else {
            self.layout.stored.iter().map(|c| format!("d.{}", quote(c))).collect()
        };
        let sql = format!(
            "SELECT {} {} ORDER BY {} LIMIT ? OFFSET ?",
            columns.join(", "),
            self.from_where,
            self.order_by
        );
        let mut params = self.params.clone();
        params.push(SqlValue::Integer(limit as i64));
        params.push(SqlValue::Integer(offset as i64));

        let mut stmt = conn.prepare(&sql).map_err(map_err)?;
        let stored = &self.layout.stored;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let mut values = Vec::with_capacity(stored.len());
                for (i, name) in stored.iter().enumerate() {
                    if let Some(v) = from_sql(row.get::<_, SqlValue>(i)?) {
                        values.push((name.clone(), v));
                    }
                }
                Ok(values)
            })
            .map_err(map_err)?;
        let mut out = Vec::new();
        for values in rows {
            out.push(self.layout.restore(values.map_err(map_err)?));
        }
        Ok(out)
    }

    fn total_rows(&self) -> Option<u64> { self.total }
}
