//! Store errors and their mapping onto the domain taxonomy.

use narwhal_core::context::TransactionId;
use narwhal_core::error::DomainError;
use thiserror::Error;

/// `PostgreSQL` SQLSTATE for a serialization failure.
const SERIALIZATION_FAILURE: &str = "40001";
/// `PostgreSQL` SQLSTATE for a detected deadlock.
const DEADLOCK_DETECTED: &str = "40P01";

/// Failures raised by the `PostgreSQL` stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The driver or the server rejected an operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the schema migrations failed.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored column could not be turned back into a domain value.
    #[error("stored column {column} is invalid: {reason}")]
    InvalidColumn {
        /// The offending column.
        column: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The transaction is not open, or was opened by another unit of work.
    #[error("transaction {0} is not open")]
    TransactionClosed(TransactionId),

    /// A store still holds the transaction while it is being finished.
    #[error("transaction {0} is still in use")]
    TransactionBusy(TransactionId),
}

impl StoreError {
    pub(crate) fn invalid_column(column: &'static str, reason: impl ToString) -> Self {
        Self::InvalidColumn {
            column,
            reason: reason.to_string(),
        }
    }
}

/// True when `err` is a unique violation of `constraint`.
pub(crate) fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.is_unique_violation() && db.constraint() == Some(constraint)
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Database(db) if is_transient(db) => DomainError::Transient(err.to_string()),
            StoreError::Database(sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_))
            | StoreError::InvalidColumn { .. } => DomainError::Decode(err.to_string()),
            StoreError::TransactionBusy(_) => DomainError::Conflict(err.to_string()),
            _ => DomainError::Infrastructure(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use narwhal_core::error::ErrorKind;

    #[test]
    fn test_pool_timeout_is_retriable() {
        let err: DomainError = StoreError::Database(sqlx::Error::PoolTimedOut).into();

        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_invalid_column_is_a_decode_error() {
        let err: DomainError = StoreError::invalid_column("state", "unknown saga state: paused").into();

        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn test_closed_transaction_is_infrastructure() {
        let err: DomainError = StoreError::TransactionClosed(TransactionId::new()).into();

        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn test_row_not_found_is_not_a_unique_violation() {
        assert!(!violates(&sqlx::Error::RowNotFound, "domain_events_pkey"));
    }
}
