//! Error taxonomy for transaction stores.
//!
//! Callers branch on the kind, never on the message: `NotFound` means a CAS or
//! lock predicate matched nothing (re-read to find out why), `UniqueConflict`
//! means the transaction is already registered, and `Storage` is everything
//! the backend could not classify.

/// Storage-level error type.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A conditional update or row lock matched zero rows. Ambiguous between
    /// "never existed" and "already moved to another status".
    #[error("not found: {0}")]
    NotFound(String),
    /// Idempotent creation observed a pre-existing gid.
    #[error("unique conflict: {0}")]
    UniqueConflict(String),
    /// Any I/O, connectivity, constraint or decoding failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_unique_conflict(&self) -> bool {
        matches!(self, StoreError::UniqueConflict(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }

    /// Wraps a driver error with a short context prefix.
    pub fn storage(prefix: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Storage(format!("{prefix}: {err}"))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
