//! Domain errors for the name cache.

use thiserror::Error;

use super::models::FailureCategory;

/// Domain-level errors that can occur in the name cache.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict { entity: String, id: String },

    #[error("Persistent tier unavailable: {0}")]
    PersistenceUnavailable(String),
}

impl DomainError {
    /// Write conflicts worth retrying immediately with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
fn is_busy_code(code: &str) -> bool {
    code.parse::<i64>().is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => DomainError::ConcurrencyConflict {
                entity: "name_record".to_string(),
                id: db.constraint().unwrap_or("unknown").to_string(),
            },
            sqlx::Error::Database(db) if db.code().is_some_and(|code| is_busy_code(&code)) => {
                DomainError::ConcurrencyConflict {
                    entity: "name_record".to_string(),
                    id: "database".to_string(),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DomainError::PersistenceUnavailable(err.to_string())
            }
            _ => DomainError::DatabaseError(err.to_string()),
        }
    }
}

/// Errors a lookup connection reports for a whole batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Lookup connection unavailable: {0}")]
    Unavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lookup timed out after {0}ms")]
    TimedOut(u64),

    #[error("Malformed lookup response: {0}")]
    MalformedResponse(String),
}

impl LookupError {
    /// Retry category for every id of the failed batch.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::MalformedResponse(_) => FailureCategory::TransientFailure,
            Self::Unavailable(_) | Self::Transport(_) | Self::TimedOut(_) => FailureCategory::NetworkError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_codes_include_extended_codes() {
        for code in ["5", "6", "261", "517", "262"] {
            assert!(is_busy_code(code), "{code}");
        }
        for code in ["19", "1555", "2067", "SQLITE_BUSY", ""] {
            assert!(!is_busy_code(code), "{code}");
        }
    }

    #[test]
    fn test_lookup_error_categories() {
        assert_eq!(
            LookupError::MalformedResponse("bad json".into()).category(),
            FailureCategory::TransientFailure
        );
        assert_eq!(LookupError::TimedOut(10_000).category(), FailureCategory::NetworkError);
        assert_eq!(LookupError::Transport("reset".into()).category(), FailureCategory::NetworkError);
    }

    #[test]
    fn test_transient_classification() {
        let conflict = DomainError::ConcurrencyConflict {
            entity: "name_record".into(),
            id: "x".into(),
        };
        assert!(conflict.is_transient());
        assert!(!DomainError::DatabaseError("syntax".into()).is_transient());
        assert!(!DomainError::PersistenceUnavailable("closed".into()).is_transient());
    }

    #[test]
    fn test_pool_timeout_maps_to_unavailable() {
        let err: DomainError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DomainError::PersistenceUnavailable(_)));
    }
}
