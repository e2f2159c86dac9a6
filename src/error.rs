//! Session handler error types

use std::fmt;

use crate::db::DbError;

/// Errors that can occur during session handler operations
#[derive(Debug)]
pub enum SessionError {
    /// Handler or connection is misconfigured
    Configuration(String),
    /// Driver tag outside the supported set
    UnsupportedDriver(String),
    /// Operation not available on the current driver
    UnsupportedOperation(String),
    /// Error reported by the database driver
    Database(DbError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            SessionError::UnsupportedDriver(tag) => {
                write!(f, "Unsupported database driver \"{}\"", tag)
            }
            SessionError::UnsupportedOperation(msg) => write!(f, "Unsupported operation: {}", msg),
            SessionError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for SessionError {
    fn from(err: DbError) -> Self {
        SessionError::Database(err)
    }
}
