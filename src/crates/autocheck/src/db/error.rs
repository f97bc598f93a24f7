//! Database error types and classification
//!
//! Driver errors are converted at the boundary into [`DatabaseError`], which
//! carries the transient/permanent split the retry layer acts on.

use super::retry::{Classify, ErrorClass};
use thiserror::Error;

/// Message fragments that indicate a dropped or stalled connection
const TRANSIENT_PATTERNS: &[&str] = &[
    "lost connection",
    "gone away",
    "timeout",
    "timed out",
    "broken pipe",
    "connection reset",
    "connection refused",
];

/// Client error numbers for "server has gone away" and "lost connection"
const TRANSIENT_CODES: &[&str] = &["2006", "2013"];

/// Custom database error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    /// Connection-level failure that may succeed on retry
    #[error("Transient database error: {0}")]
    Transient(String),

    /// Statement or data error that will fail again
    #[error("Database error: {0}")]
    Permanent(String),

    /// No connection became available within the acquire timeout
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid endpoint or driver configuration
    #[error("Database configuration error: {0}")]
    Configuration(String),

    /// Row mapping error
    #[error("Row mapping error: {0}")]
    RowMapping(String),
}

impl DatabaseError {
    /// Create a NotFound error with context
    pub fn not_found(context: impl Into<String>) -> Self {
        DatabaseError::NotFound(context.into())
    }

    /// Create a RowMapping error
    pub fn row_mapping(msg: impl Into<String>) -> Self {
        DatabaseError::RowMapping(msg.into())
    }

    /// Classify a driver message as transient or permanent
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if is_transient_message(&msg) {
            DatabaseError::Transient(msg)
        } else {
            DatabaseError::Permanent(msg)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound(_))
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, DatabaseError::PoolExhausted(_))
    }
}

impl Classify for DatabaseError {
    fn classify(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

/// Whether a driver message describes a connection-level failure
pub fn is_transient_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_ascii_digit())
        .any(|token| TRANSIENT_CODES.contains(&token))
}

/// Result type for database operations
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Convert sqlx::Error to DatabaseError
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                DatabaseError::NotFound("No matching row found in database".to_string())
            }
            sqlx::Error::ColumnNotFound(col) => {
                DatabaseError::RowMapping(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DatabaseError::RowMapping(
                format!("Column index out of bounds: {} >= {}", index, len),
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DatabaseError::RowMapping(format!("Error decoding column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                DatabaseError::RowMapping(format!("Decode error: {}", source))
            }
            sqlx::Error::Configuration(msg) => {
                DatabaseError::Configuration(format!("Configuration error: {}", msg))
            }
            sqlx::Error::Io(err) => DatabaseError::Transient(format!("IO error: {}", err)),
            sqlx::Error::Tls(err) => DatabaseError::Configuration(format!("TLS error: {}", err)),
            sqlx::Error::Protocol(msg) => {
                DatabaseError::Transient(format!("Protocol error: {}", msg))
            }
            sqlx::Error::PoolTimedOut => {
                DatabaseError::Transient("Driver pool timed out".to_string())
            }
            sqlx::Error::WorkerCrashed => {
                DatabaseError::Transient("Connection worker crashed".to_string())
            }
            sqlx::Error::Database(db_err) => DatabaseError::from_message(db_err.to_string()),
            err => DatabaseError::from_message(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_messages() {
        assert!(is_transient_message("Lost connection to MySQL server during query"));
        assert!(is_transient_message("MySQL server has gone away"));
        assert!(is_transient_message("Read timeout"));
        assert!(is_transient_message("error 2013 (HY000)"));
        assert!(!is_transient_message("Duplicate entry '1' for key 'PRIMARY'"));
        assert!(!is_transient_message("error 12006"));
    }

    #[test]
    fn test_from_message_classifies() {
        assert!(DatabaseError::from_message("MySQL server has gone away").is_transient());
        assert!(!DatabaseError::from_message("syntax error near SELEC").is_transient());
    }

    #[test]
    fn test_classify_only_transient_retries() {
        assert_eq!(
            DatabaseError::Transient("x".into()).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            DatabaseError::PoolExhausted("x".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            DatabaseError::not_found("x").classify(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_sqlx_conversions() {
        let db_err: DatabaseError = sqlx::Error::RowNotFound.into();
        assert!(db_err.is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let db_err: DatabaseError = sqlx::Error::Io(io).into();
        assert!(db_err.is_transient());

        let db_err: DatabaseError = sqlx::Error::ColumnNotFound("EquipNo".into()).into();
        assert!(matches!(db_err, DatabaseError::RowMapping(_)));
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::PoolExhausted("master".into());
        assert!(err.to_string().contains("exhausted"));
    }
}
