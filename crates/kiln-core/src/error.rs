//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Contention in the store or task queue. The whole call may be retried.
    #[error("transient: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Prefixes the message with `context`, keeping the error kind.
    pub fn annotate(self, context: impl std::fmt::Display) -> Self {
        match self {
            Error::NotFound(m) => Error::NotFound(format!("{context}: {m}")),
            Error::InvalidInput(m) => Error::InvalidInput(format!("{context}: {m}")),
            Error::AlreadyExists(m) => Error::AlreadyExists(format!("{context}: {m}")),
            Error::Conflict(m) => Error::Conflict(format!("{context}: {m}")),
            Error::Transient(m) => Error::Transient(format!("{context}: {m}")),
            Error::Internal(m) => Error::Internal(format!("{context}: {m}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_keeps_kind() {
        let err = Error::Transient("deadlock".to_string()).annotate("build 42");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "transient: build 42: deadlock");
    }
}
