//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Serialization failure, deadlock or a lost race on a unique key.
    /// Retrying the transaction may succeed.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }
}

/// SQLSTATEs that mean "try again".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|e| e.code())
            .map(|c| c.into_owned());
        match code.as_deref() {
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION) => {
                DbError::Conflict(err.to_string())
            }
            _ => DbError::Database(err),
        }
    }
}

impl From<DbError> for kiln_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(m) => kiln_core::Error::NotFound(m),
            DbError::Duplicate(m) => kiln_core::Error::AlreadyExists(m),
            DbError::Conflict(m) => kiln_core::Error::Transient(m),
            other => kiln_core::Error::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_transient() {
        let err = DbError::Conflict("could not serialize access".to_string());
        assert!(err.is_transient());
        let core: kiln_core::Error = err.into();
        assert!(core.is_transient());

        let core: kiln_core::Error = DbError::Duplicate("x".to_string()).into();
        assert!(matches!(core, kiln_core::Error::AlreadyExists(_)));
        assert!(!DbError::NotFound("x".to_string()).is_transient());
    }
}
