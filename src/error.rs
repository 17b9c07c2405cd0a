//! Error kinds shared by every layer of the engine.
//!
//! Source, reducer and space-index code returns [`EngineError`] upward with `?`.
//! Background workers (backlinks watcher, full-text worker) log it and keep going.
//! The FFI layer folds it into an [`AppResponse`](crate::app_response::AppResponse).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Object, details, relation or mapping missing. Callers may treat it as empty.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write path short-circuit: the new details equal the stored ones.
    #[error("details not changed")]
    DetailsNotChanged,

    #[error("restricted: {0}")]
    Restricted(String),

    /// Malformed change content, invalid unique key, unsupported layout.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("source is read-only: {0}")]
    ReadOnly(String),

    #[error("change payload is {size} bytes, limit is {limit}")]
    BigChangeSize { size: usize, limit: usize },

    /// Optimistic retry budget exhausted.
    #[error("object store conflict on '{id}' after {attempts} attempts")]
    ObjectStoreConflict { id: String, attempts: usize },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("database error: {0}")]
    Database(#[from] lmdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("space '{0}' has no tree builder")]
    SpaceWithoutTreeBuilder(String),

    #[error("failed to parse active view '{0}'")]
    ParseView(String),

    #[error("operation cancelled")]
    Cancelled,

    /// An id is already bound to another space.
    #[error("object '{id}' belongs to space '{existing}', not '{requested}'")]
    SpaceMismatch {
        id: String,
        existing: String,
        requested: String,
    },

    /// Returned by the editor boundary when the object is open in the cache.
    #[error("object '{0}' is already opened")]
    ObjectCached(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_not_changed(&self) -> bool {
        matches!(self, EngineError::DetailsNotChanged)
    }
}

impl From<ciborium::de::Error<std::io::Error>> for EngineError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        EngineError::Codec(format!("cbor decode: {err}"))
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for EngineError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        EngineError::Codec(format!("cbor encode: {err}"))
    }
}

impl From<lz4_flex::block::DecompressError> for EngineError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        EngineError::Codec(format!("lz4: {err}"))
    }
}
