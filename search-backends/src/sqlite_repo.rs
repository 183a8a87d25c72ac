use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode};
use search_model::{FieldKind, Result, SearchError, Value};

use crate::layout::{FieldLayout, PreparedDocument};

pub(crate) const ENGINE: &str = "sqlite";
pub const DOCUMENTS_TABLE: &str = "documents";
pub const FTS_TABLE: &str = "documents_fts";

/// Column names FTS5 or the content table reserve for themselves.
const RESERVED_COLUMNS: &[&str] = &["rowid", "rank", DOCUMENTS_TABLE, FTS_TABLE];

/// Native SQLite schema derived from the unified schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteTable {
    /// `(column, SQL type, unique)` for every field and shadow.
    pub columns: Vec<(String, &'static str, bool)>,
    /// Tokenized text columns mirrored into the FTS5 table. Opaque text
    /// stays on the content table and is compared exactly.
    pub fts_columns: Vec<String>,
}

impl SqliteTable {
    pub fn from_layout(layout: &FieldLayout) -> Result<Self> {
        let mut columns = Vec::new();
        let mut fts_columns = Vec::new();
        for (name, field) in layout.schema().fields() {
            if RESERVED_COLUMNS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                return Err(SearchError::SchemaViolation(format!("field name {name} is reserved by the sqlite backend")));
            }
            match field.kind {
                FieldKind::Numeric => columns.push((name.to_string(), "INTEGER", false)),
                FieldKind::Identifier => columns.push((name.to_string(), "TEXT", true)),
                FieldKind::ShortText | FieldKind::LongText => {
                    columns.push((name.to_string(), "TEXT", false));
                    if field.is_tokenized() {
                        fts_columns.push(name.to_string());
                    }
                }
            }
        }
        for (_, shadow) in &layout.shadows {
            columns.push((shadow.clone(), "TEXT", false));
        }
        Ok(Self { columns, fts_columns })
    }

    pub fn has_fts(&self) -> bool { !self.fts_columns.is_empty() }

    /// DDL for the content table, its FTS5 mirror and the sync triggers.
    pub fn ddl(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|(name, ty, unique)| format!("{} {}{}", quote(name), ty, if *unique { " UNIQUE" } else { "" }))
            .collect();
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {DOCUMENTS_TABLE} (\n    rowid INTEGER PRIMARY KEY,\n    {}\n);\n",
            cols.join(",\n    ")
        );
        for (name, _, _) in &self.columns {
            if crate::layout::is_shadow(name) {
                sql.push_str(&format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {DOCUMENTS_TABLE}({});\n",
                    quote(&format!("idx_{name}")),
                    quote(name)
                ));
            }
        }
        if self.has_fts() {
            let fts_cols: Vec<String> = self.fts_columns.iter().map(|c| quote(c)).collect();
            let new_cols: Vec<String> = self.fts_columns.iter().map(|c| format!("new.{}", quote(c))).collect();
            let old_cols: Vec<String> = self.fts_columns.iter().map(|c| format!("old.{}", quote(c))).collect();
            sql.push_str(&format!(
                r#"
CREATE VIRTUAL TABLE IF NOT EXISTS {FTS_TABLE} USING fts5(
    {cols},
    content='{DOCUMENTS_TABLE}',
    content_rowid='rowid',
    tokenize = 'unicode61'
);
CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON {DOCUMENTS_TABLE} BEGIN
    INSERT INTO {FTS_TABLE}(rowid, {cols}) VALUES (new.rowid, {new});
END;
CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON {DOCUMENTS_TABLE} BEGIN
    INSERT INTO {FTS_TABLE}({FTS_TABLE}, rowid, {cols}) VALUES ('delete', old.rowid, {old});
END;
"#,
                cols = fts_cols.join(", "),
                new = new_cols.join(", "),
                old = old_cols.join(", "),
            ));
        }
        sql
    }
}

/// One SQLite connection holding a logical index.
pub struct SqliteRepo {
    conn: Connection,
    path: PathBuf,
}

impl SqliteRepo {
    /// Open (or create) the database file. Lock waits are disabled so a
    /// competing writer surfaces as `LockConflict` right away.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(map_err)?;
        conn.busy_timeout(Duration::ZERO).map_err(map_err)?;
        conn.pragma_update(None, "journal_mode", &"WAL").map_err(map_err)?;
        conn.pragma_update(None, "synchronous", &"FULL").map_err(map_err)?;
        Ok(Self { conn, path })
    }

    pub(crate) fn conn(&self) -> &Connection { &self.conn }

    pub fn path(&self) -> &Path { &self.path }

    pub fn has_documents_table(&self) -> Result<bool> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [DOCUMENTS_TABLE],
                |r| r.get(0),
            )
            .map_err(map_err)?;
        Ok(n > 0)
    }

    pub fn create_tables(&self, table: &SqliteTable) -> Result<()> {
        self.conn.execute_batch(&table.ddl()).map_err(map_err)
    }

    /// Take the database write lock without waiting.
    pub fn begin_immediate(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| match map_err(e) {
            SearchError::LockConflict(msg) => {
                SearchError::LockConflict(format!("{} is locked by another writer: {msg}", self.path.display()))
            }
            other => other,
        })
    }

    pub fn commit(&self) -> Result<()> { self.conn.execute_batch("COMMIT").map_err(map_err) }

    pub fn rollback(&self) -> Result<()> { self.conn.execute_batch("ROLLBACK").map_err(map_err) }

    pub fn insert(&self, table: &SqliteTable, doc: &PreparedDocument) -> Result<()> {
        let mut names = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for (name, _, _) in &table.columns {
            if let Some(value) = doc.get(name) {
                names.push(quote(name));
                params.push(to_sql(value));
            }
        }
        let sql = if names.is_empty() {
            format!("INSERT INTO {DOCUMENTS_TABLE} DEFAULT VALUES")
        } else {
            let placeholders = vec!["?"; names.len()].join(", ");
            format!("INSERT INTO {DOCUMENTS_TABLE} ({}) VALUES ({placeholders})", names.join(", "))
        };
        self.conn
            .execute(&sql, rusqlite::params_from_iter(params.into_iter()))
            .map_err(map_err)?;
        Ok(())
    }

    /// Delete by identifier column. Returns affected rows.
    pub fn delete_by_key(&self, column: &str, key: &str) -> Result<usize> {
        let sql = format!("DELETE FROM {DOCUMENTS_TABLE} WHERE {} = ?1", quote(column));
        self.conn.execute(&sql, [key]).map_err(map_err)
    }
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

pub(crate) fn from_sql(value: SqlValue) -> Option<Value> {
    match value {
        SqlValue::Integer(v) => Some(Value::Integer(v)),
        SqlValue::Real(v) => Some(Value::Integer(v as i64)),
        SqlValue::Text(s) => Some(Value::Text(s)),
        SqlValue::Null | SqlValue::Blob(_) => None,
    }
}

pub(crate) fn map_err(e: rusqlite::Error) -> SearchError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            SearchError::LockConflict(e.to_string())
        }
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::PermissionDenied) =>
        {
            SearchError::BackendUnavailable(e.to_string())
        }
        _ => SearchError::engine(ENGINE, e.to_string()),
    }
}
