use polars::prelude::PolarsError;
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Schema mismatches and per-value parse failures never show up here: unknown
/// filters and measures are dropped and unparsable values become missing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configured data source could not be reached or found
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),

    /// The embedded query engine rejected or failed a query
    #[error("query execution failed: {0}")]
    Query(#[from] duckdb::Error),

    #[error("dataframe operation failed: {0}")]
    Frame(#[from] PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dataset lock poisoned")]
    LockPoisoned,
}

impl EngineError {
    /// True when the error only means "try the next acquisition strategy"
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            EngineError::SourceUnavailable(_) | EngineError::Http(_) | EngineError::Io(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        EngineError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
