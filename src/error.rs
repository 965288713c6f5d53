use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Store failures abort the current operation without touching the working
/// set. IMAP failures surface on the read paths; `synchronize` swallows them
/// and leaves the cache stale but consistent.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Encoding error: {0}")]
    Encode(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Store(err.to_string())
    }
}

impl From<r2d2::Error> for CacheError {
    fn from(err: r2d2::Error) -> Self {
        CacheError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Encode(err.to_string())
    }
}
