pub mod layout;
pub mod sqlite_repo;
pub mod fts5_index;
pub mod tantivy_index;
pub mod transport;
pub mod elastic_index;

pub use elastic_index::{ElasticBackend, ElasticParams};
pub use fts5_index::{SqliteBackend, SqliteParams};
pub use search_model::{Document, Query, Result, Schema, SearchError, SortOrder};
pub use tantivy_index::{TantivyBackend, TantivyParams};
pub use transport::{HttpTransport, Method, Response, Transport};

/// Adapter contract every engine implements identically from the caller's side.
///
/// `add`, `replace` and `remove` open a write session on demand. A write
/// session ends with `commit`, `rollback` or `close`.
pub trait SearchBackend: Send {
    fn name(&self) -> &'static str;
    fn schema(&self) -> &Schema;
    fn state(&self) -> SessionState;

    /// Connect lazily. `write` also creates the index if missing and takes
    /// the index write lock, failing with `LockConflict` if it is held.
    fn open(&mut self, write: bool) -> Result<()>;
    /// Release connection and lock; pending writes are discarded.
    fn close(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    /// Add a document. An existing document with the same identifier is replaced.
    fn add(&mut self, doc: &Document) -> Result<()>;
    fn replace(&mut self, id: &str, doc: &Document) -> Result<()>;
    fn remove(&mut self, id: &str) -> Result<()>;

    fn find<'a>(&'a mut self, query: &Query, order: &SortOrder) -> Result<Box<dyn ResultCursor + 'a>>;
}

/// Per-query handle executing paged fetches against a compiled query.
pub trait ResultCursor {
    /// Fetch a 1-indexed page. Re-executes the query on every call.
    fn page(&mut self, page: usize, page_size: usize) -> Result<Vec<Document>>;
    /// Engine total-match estimate from the latest page fetch.
    fn total_rows(&self) -> Option<u64>;
}

/// Write-session state shared by all adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Read,
    Write,
}

impl SessionState {
    pub fn is_open(self) -> bool { self != SessionState::Closed }

    /// Guard for operations that require a write session.
    pub fn require_write(self, op: &str) -> Result<()> {
        if self == SessionState::Write {
            Ok(())
        } else {
            Err(SearchError::InvalidState(format!("{op} requires a write session (state: {self:?})")))
        }
    }
}

/// Cursor over an index that has never been written.
#[derive(Debug, Default)]
pub struct EmptyCursor {
    total: Option<u64>,
}

impl ResultCursor for EmptyCursor {
    fn page(&mut self, page: usize, page_size: usize) -> Result<Vec<Document>> {
        page_window(page, page_size)?;
        self.total = Some(0);
        Ok(Vec::new())
    }

    fn total_rows(&self) -> Option<u64> { self.total }
}

/// `(offset, limit)` for a 1-indexed page.
pub fn page_window(page: usize, page_size: usize) -> Result<(usize, usize)> {
    if page == 0 {
        return Err(SearchError::InvalidQuery("page numbers start at 1".into()));
    }
    let offset = (page - 1)
        .checked_mul(page_size)
        .ok_or_else(|| SearchError::InvalidQuery(format!("page {page} of size {page_size} overflows")))?;
    Ok((offset, page_size))
}
