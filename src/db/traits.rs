//! Database connection interface
//!
//! The handler talks to a relational engine through this trait pair instead
//! of a concrete client crate, so any engine with a driver adapter can back
//! it. Placeholders in statement text are uniformly `?`; an adapter for a
//! concrete engine translates them to its native placeholder style, the same
//! way a generic database layer would.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// A bind value for a prepared statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// Character data
    Text(String),
    /// Signed 64-bit integer
    Int(i64),
    /// Large binary data
    Bytes(Vec<u8>),
}

/// One fetched row, addressed by column position
#[derive(Debug, Clone)]
pub struct Row(Vec<SqlValue>);

impl Row {
    /// Wrap fetched column values in declaration order
    pub fn new(values: Vec<SqlValue>) -> Self {
        Row(values)
    }

    /// Read a column as raw bytes; text columns decay to their UTF-8 bytes
    pub fn bytes_at(&self, idx: usize) -> Result<Vec<u8>, DbError> {
        match self.0.get(idx) {
            Some(SqlValue::Bytes(b)) => Ok(b.clone()),
            Some(SqlValue::Text(s)) => Ok(s.clone().into_bytes()),
            Some(other) => Err(DbError::new(format!(
                "column {} is not binary data: {:?}",
                idx, other
            ))),
            None => Err(DbError::new(format!("no column at position {}", idx))),
        }
    }

    /// Read a column as a signed integer; numeric text is parsed
    pub fn i64_at(&self, idx: usize) -> Result<i64, DbError> {
        match self.0.get(idx) {
            Some(SqlValue::Int(n)) => Ok(*n),
            Some(SqlValue::Text(s)) => s
                .parse()
                .map_err(|_| DbError::new(format!("column {} is not an integer: {:?}", idx, s))),
            Some(other) => Err(DbError::new(format!(
                "column {} is not an integer: {:?}",
                idx, other
            ))),
            None => Err(DbError::new(format!("no column at position {}", idx))),
        }
    }
}

/// Error reported by a database driver
#[derive(Debug, Clone)]
pub struct DbError {
    /// Five-character SQLSTATE code, when the driver provides one
    pub sqlstate: Option<String>,
    /// Driver message text
    pub message: String,
}

impl DbError {
    /// An error with no SQLSTATE code
    pub fn new(message: impl Into<String>) -> Self {
        DbError {
            sqlstate: None,
            message: message.into(),
        }
    }

    /// An error carrying a SQLSTATE code
    pub fn with_sqlstate(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        DbError {
            sqlstate: Some(sqlstate.into()),
            message: message.into(),
        }
    }

    /// Unique-key violations report SQLSTATE class "23"
    pub fn is_duplicate_key(&self) -> bool {
        self.sqlstate
            .as_deref()
            .is_some_and(|code| code.starts_with("23"))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(code) => write!(f, "SQLSTATE[{}]: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// A live connection to a relational engine
///
/// The session handler owns the connection for the span of a request; hosts
/// must not interleave their own transactional work on an injected
/// connection between `read` and `close`, because the row lock spans that
/// window.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Driver tag of the engine behind this connection
    /// (e.g. "mysql", "pgsql", "sqlite", "oci", "sqlsrv")
    fn driver(&self) -> &str;

    /// Server version string, if the driver exposes one
    fn server_version(&self) -> Option<String>;

    /// Whether the connection reports failures as errors rather than
    /// silent status codes
    fn strict_errors(&self) -> bool {
        true
    }

    /// Run a statement without parameters, returning the affected row count
    async fn exec(&self, sql: &str) -> Result<u64, DbError>;

    /// Run a parameterized statement, returning the affected row count
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Run a query expected to produce at most one row
    async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, DbError>;

    /// Start a native transaction
    async fn begin(&self) -> Result<(), DbError>;

    /// Commit the native transaction
    async fn commit(&self) -> Result<(), DbError>;

    /// Roll back the native transaction
    async fn rollback(&self) -> Result<(), DbError>;
}

/// Factory for the lazy connection path
///
/// The DSN string is passed through verbatim; interpreting it is the
/// connector's business.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for the given DSN
    async fn connect(
        &self,
        dsn: &str,
        username: Option<&str>,
        password: Option<&str>,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_classification() {
        assert!(DbError::with_sqlstate("23000", "dup").is_duplicate_key());
        assert!(DbError::with_sqlstate("23505", "dup").is_duplicate_key());
        assert!(!DbError::with_sqlstate("42S01", "exists").is_duplicate_key());
        assert!(!DbError::new("no state").is_duplicate_key());
    }

    #[test]
    fn row_accessors() {
        let row = Row::new(vec![
            SqlValue::Bytes(vec![0, 159, 1]),
            SqlValue::Int(42),
            SqlValue::Text("7".into()),
        ]);
        assert_eq!(row.bytes_at(0).unwrap(), vec![0, 159, 1]);
        assert_eq!(row.i64_at(1).unwrap(), 42);
        assert_eq!(row.i64_at(2).unwrap(), 7);
        assert!(row.i64_at(0).is_err());
        assert!(row.bytes_at(5).is_err());
    }
}
