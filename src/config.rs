//! Session handler configuration

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// How concurrent access to one session id is serialized
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No locking; last writer wins
    None,
    /// Engine-level advisory lock named by the session id
    Advisory,
    /// Row-level lock via a locking SELECT inside a transaction,
    /// held until the end-of-request commit
    Transactional,
}

/// Ambient source of the session max lifetime, consulted at every `write`
///
/// The handler never caches the value: a provider hook is re-read on each
/// write, so hosts can mirror runtime-reconfigurable settings.
#[derive(Clone)]
pub enum MaxLifetime {
    /// Fixed number of seconds
    Fixed(i64),
    /// Host-installed hook returning seconds
    Provider(Arc<dyn Fn() -> i64 + Send + Sync>),
}

impl MaxLifetime {
    /// Resolve the current value in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            MaxLifetime::Fixed(secs) => *secs,
            MaxLifetime::Provider(hook) => hook(),
        }
    }
}

impl fmt::Debug for MaxLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxLifetime::Fixed(secs) => f.debug_tuple("Fixed").field(secs).finish(),
            MaxLifetime::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

/// Configuration for the session handler
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Session table name (default: "sessions")
    pub table: String,

    /// Primary key column (default: "sess_id")
    pub id_col: String,

    /// Payload column (default: "sess_data")
    pub data_col: String,

    /// Absolute expiry column, seconds since the epoch (default: "sess_expiry")
    pub expiry_col: String,

    /// Last write timestamp column (default: "sess_time")
    pub time_col: String,

    /// Username passed to the connector on lazy connects
    pub username: Option<String>,

    /// Password passed to the connector on lazy connects
    pub password: Option<String>,

    /// Opaque driver options passed to the connector on lazy connects
    pub connection_options: HashMap<String, String>,

    /// Locking strategy, chosen at construction (default: Transactional)
    pub lock_mode: LockMode,

    /// Session max lifetime source (default: fixed 1440 seconds)
    pub max_lifetime: MaxLifetime,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            table: "sessions".to_string(),
            id_col: "sess_id".to_string(),
            data_col: "sess_data".to_string(),
            expiry_col: "sess_expiry".to_string(),
            time_col: "sess_time".to_string(),
            username: None,
            password: None,
            connection_options: HashMap::new(),
            lock_mode: LockMode::Transactional,
            max_lifetime: MaxLifetime::Fixed(1440),
        }
    }
}

impl SessionOptions {
    /// Create options with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session table name (default: "sessions")
    pub fn with_table<S: Into<String>>(mut self, table: S) -> Self {
        self.table = table.into();
        self
    }

    /// Set the primary key column (default: "sess_id")
    pub fn with_id_col<S: Into<String>>(mut self, col: S) -> Self {
        self.id_col = col.into();
        self
    }

    /// Set the payload column (default: "sess_data")
    pub fn with_data_col<S: Into<String>>(mut self, col: S) -> Self {
        self.data_col = col.into();
        self
    }

    /// Set the expiry column (default: "sess_expiry")
    pub fn with_expiry_col<S: Into<String>>(mut self, col: S) -> Self {
        self.expiry_col = col.into();
        self
    }

    /// Set the last-write-time column (default: "sess_time")
    pub fn with_time_col<S: Into<String>>(mut self, col: S) -> Self {
        self.time_col = col.into();
        self
    }

    /// Set the username for lazy connects
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password for lazy connects
    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set an opaque driver option for lazy connects
    pub fn with_connection_option<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.connection_options.insert(key.into(), value.into());
        self
    }

    /// Set the locking strategy (default: Transactional)
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Set a fixed max lifetime in seconds (default: 1440)
    pub fn with_max_lifetime(mut self, seconds: i64) -> Self {
        self.max_lifetime = MaxLifetime::Fixed(seconds);
        self
    }

    /// Install a hook consulted for the max lifetime at every write
    pub fn with_max_lifetime_provider(
        mut self,
        hook: Arc<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        self.max_lifetime = MaxLifetime::Provider(hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn defaults() {
        let opts = SessionOptions::default();
        assert_eq!(opts.table, "sessions");
        assert_eq!(opts.id_col, "sess_id");
        assert_eq!(opts.data_col, "sess_data");
        assert_eq!(opts.expiry_col, "sess_expiry");
        assert_eq!(opts.time_col, "sess_time");
        assert_eq!(opts.lock_mode, LockMode::Transactional);
        assert_eq!(opts.max_lifetime.seconds(), 1440);
    }

    #[test]
    fn builders_chain() {
        let opts = SessionOptions::new()
            .with_table("app_sessions")
            .with_id_col("id")
            .with_lock_mode(LockMode::Advisory)
            .with_max_lifetime(60)
            .with_connection_option("charset", "utf8mb4");
        assert_eq!(opts.table, "app_sessions");
        assert_eq!(opts.id_col, "id");
        assert_eq!(opts.lock_mode, LockMode::Advisory);
        assert_eq!(opts.max_lifetime.seconds(), 60);
        assert_eq!(
            opts.connection_options.get("charset").map(String::as_str),
            Some("utf8mb4")
        );
    }

    #[test]
    fn lifetime_provider_is_reconsulted() {
        let value = Arc::new(AtomicI64::new(10));
        let hook = Arc::clone(&value);
        let opts = SessionOptions::new()
            .with_max_lifetime_provider(Arc::new(move || hook.load(Ordering::SeqCst)));
        assert_eq!(opts.max_lifetime.seconds(), 10);
        value.store(99, Ordering::SeqCst);
        assert_eq!(opts.max_lifetime.seconds(), 99);
    }
}
