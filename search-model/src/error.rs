/// Error taxonomy shared by the model, every backend adapter and the facade.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Document or schema does not conform; raised before any engine call.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    /// Another writer holds the index write lock. Retryable by the caller.
    #[error("index is locked: {0}")]
    LockConflict(String),
    /// Connection, network or filesystem failure reported by the engine client.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Lifecycle misuse, e.g. commit without a write session.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Any other engine-native error, with the engine message kept verbatim.
    #[error("{engine} error: {message}")]
    Engine { engine: &'static str, message: String },
}

impl SearchError {
    pub fn engine(engine: &'static str, message: impl Into<String>) -> Self {
        SearchError::Engine { engine, message: message.into() }
    }

    /// True for errors the caller may retry as-is (lock contention).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::LockConflict(_))
    }
}

pub type Result<T, E = SearchError> = std::result::Result<T, E>;
