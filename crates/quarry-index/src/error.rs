use crate::definition::IndexId;

/// Errors surfaced by the index engine.
///
/// Extraction and store trouble is contained at the scheduler/store boundary:
/// corruption and version skew are answered internally with a rebuild, and
/// queries only ever see [`IndexError::UnknownIndex`] (a programmer error) or
/// environmental I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("unknown index id {id}")]
    UnknownIndex { id: IndexId },

    #[error("index id {id} registered twice")]
    DuplicateIndex { id: IndexId },

    #[error("persisted index is corrupt: {message}")]
    Corrupt { message: String },

    #[error(transparent)]
    Storage(#[from] quarry_storage::StorageError),

    #[error(transparent)]
    Cache(#[from] quarry_cache::CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// True when the error means the persisted store can no longer be
    /// trusted and must be discarded and rebuilt.
    pub(crate) fn requires_rebuild(&self) -> bool {
        match self {
            IndexError::Corrupt { .. } => true,
            IndexError::Storage(err) => err.is_corruption(),
            IndexError::Cache(quarry_cache::CacheError::Json { .. }) => true,
            IndexError::Cache(quarry_cache::CacheError::Storage(err)) => err.is_corruption(),
            _ => false,
        }
    }
}
