//! Database-backed session save handler
//!
//! [`SqlSessionHandler`] persists opaque session payloads in a single
//! database table and serializes concurrent access to each session id
//! according to the configured [`LockMode`]. The handler implements the
//! save-handler callback contract ([`SaveHandler`]) a request pipeline
//! drives: `open`, `read`, `write`, `destroy`, `gc`, `close`.
//!
//! A handler instance is single-threaded; callbacks are invoked
//! sequentially by the host. Concurrency arises across requests sharing the
//! same database, and is resolved there: by row locks under
//! [`LockMode::Transactional`], by engine advisory locks under
//! [`LockMode::Advisory`], or not at all under [`LockMode::None`]
//! (last writer wins).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{LockMode, SessionOptions};
use crate::db::{Connection, Connector, SqlValue};
use crate::dialect::{Driver, SqlStatement};
use crate::error::SessionError;

/// The save-handler contract driven by the host request lifecycle
///
/// For one request the host calls `open`, then `read`, then zero or more of
/// `write`/`destroy`, then `close`. `gc` may be called between `open` and
/// `close`; its work is deferred to `close`.
#[async_trait]
pub trait SaveHandler {
    /// Prepare the handler for a request, connecting if needed.
    /// `save_path` serves as the DSN when none was configured.
    async fn open(&mut self, save_path: &str, session_name: &str) -> Result<(), SessionError>;

    /// Fetch the payload for `id` under the configured lock mode.
    /// A missing or expired session yields an empty payload; the two are
    /// told apart through `is_session_expired` on the concrete handler.
    async fn read(&mut self, id: &str) -> Result<Vec<u8>, SessionError>;

    /// Persist `data` under `id` with a fresh expiry
    async fn write(&mut self, id: &str, data: &[u8]) -> Result<(), SessionError>;

    /// Delete the session row for `id`
    async fn destroy(&mut self, id: &str) -> Result<(), SessionError>;

    /// Request a purge of expired sessions, performed at `close`
    async fn gc(&mut self, max_lifetime: i64) -> Result<u64, SessionError>;

    /// End the request: commit, release advisory locks, run the deferred
    /// purge, and drop a lazily opened connection
    async fn close(&mut self) -> Result<(), SessionError>;
}

enum Gateway {
    /// Host-injected connection that outlives the handler
    Injected(Arc<dyn Connection>),
    /// Connect on first use; the connection is dropped again at `close`
    Lazy {
        connector: Arc<dyn Connector>,
        dsn: Option<String>,
        live: Option<Arc<dyn Connection>>,
    },
}

impl std::fmt::Debug for SqlSessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSessionHandler")
            .field("driver", &self.driver)
            .field("in_transaction", &self.in_transaction)
            .field("gc_called", &self.gc_called)
            .field("session_expired", &self.session_expired)
            .finish()
    }
}

/// Session save handler backed by a relational database
pub struct SqlSessionHandler {
    gateway: Gateway,
    options: SessionOptions,
    driver: Option<Driver>,
    in_transaction: bool,
    gc_called: bool,
    session_expired: bool,
    /// Advisory release statements, drained FIFO at `close`
    pending_releases: Vec<SqlStatement>,
}

impl SqlSessionHandler {
    /// Wrap an injected live connection
    ///
    /// The connection must report failures as errors; one that signals them
    /// through silent status codes is rejected, because the handler's retry
    /// and rollback logic keys off error classification.
    pub fn new(
        conn: Arc<dyn Connection>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        if !conn.strict_errors() {
            return Err(SessionError::Configuration(
                "connection must report failures as errors, not silent status codes".to_string(),
            ));
        }
        Ok(Self {
            gateway: Gateway::Injected(conn),
            options,
            driver: None,
            in_transaction: false,
            gc_called: false,
            session_expired: false,
            pending_releases: Vec::new(),
        })
    }

    /// Connect lazily through `connector` when the handler is first used
    ///
    /// With no `dsn`, the save path the host supplies at `open` is used
    /// instead. The connection is dropped at `close` and reopened on the
    /// next request.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        dsn: Option<String>,
        options: SessionOptions,
    ) -> Self {
        Self {
            gateway: Gateway::Lazy {
                connector,
                dsn,
                live: None,
            },
            options,
            driver: None,
            in_transaction: false,
            gc_called: false,
            session_expired: false,
            pending_releases: Vec::new(),
        }
    }

    /// Whether the last `read` found a session that had already expired
    /// (as opposed to one that never existed)
    pub fn is_session_expired(&self) -> bool {
        self.session_expired
    }

    /// Create the session table for the connection's driver
    ///
    /// One-shot bootstrap helper. Driver errors surface verbatim; in
    /// particular "table already exists" is the caller's to interpret.
    pub async fn create_table(&mut self) -> Result<(), SessionError> {
        let (conn, driver) = self.ensure_conn(None).await?;
        let sql = driver.create_table_sql(&self.options);
        if let Err(e) = conn.exec(&sql).await {
            if let Err(rb) = self.rollback_transaction().await {
                tracing::warn!(error = %rb, "rollback after failed table creation also failed");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Materialize the connection, resolving the driver tag on first use
    async fn ensure_conn(
        &mut self,
        fallback_dsn: Option<&str>,
    ) -> Result<(Arc<dyn Connection>, Driver), SessionError> {
        let conn = match &mut self.gateway {
            Gateway::Injected(conn) => conn.clone(),
            Gateway::Lazy {
                live: Some(conn), ..
            } => conn.clone(),
            Gateway::Lazy {
                connector,
                dsn,
                live,
            } => {
                let target = dsn
                    .clone()
                    .or_else(|| fallback_dsn.map(str::to_string))
                    .ok_or_else(|| {
                        SessionError::Configuration(
                            "no DSN configured and none supplied by the host".to_string(),
                        )
                    })?;
                let conn = connector
                    .connect(
                        &target,
                        self.options.username.as_deref(),
                        self.options.password.as_deref(),
                        &self.options.connection_options,
                    )
                    .await?;
                if !conn.strict_errors() {
                    return Err(SessionError::Configuration(
                        "connection must report failures as errors, not silent status codes"
                            .to_string(),
                    ));
                }
                tracing::debug!(driver = conn.driver(), "session store connected");
                *live = Some(conn.clone());
                conn
            }
        };
        let driver = match self.driver {
            Some(driver) => driver,
            None => {
                let tag = conn.driver().to_string();
                let driver =
                    Driver::from_tag(&tag).ok_or(SessionError::UnsupportedDriver(tag))?;
                self.driver = Some(driver);
                driver
            }
        };
        Ok((conn, driver))
    }

    fn live_conn(&self) -> Option<Arc<dyn Connection>> {
        match &self.gateway {
            Gateway::Injected(conn) => Some(conn.clone()),
            Gateway::Lazy { live, .. } => live.clone(),
        }
    }

    async fn begin_transaction(
        &mut self,
        conn: &Arc<dyn Connection>,
        driver: Driver,
    ) -> Result<(), SessionError> {
        if self.in_transaction {
            return Ok(());
        }
        match driver {
            // Reserve the database for writing up front; SQLite has no row
            // locks for the SELECT to take.
            Driver::Sqlite => {
                conn.exec("BEGIN IMMEDIATE TRANSACTION").await?;
            }
            // The default REPEATABLE READ takes gap locks that deadlock
            // concurrent first-touch sessions.
            Driver::MySql => {
                conn.exec("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
                    .await?;
                conn.begin().await?;
            }
            _ => conn.begin().await?,
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), SessionError> {
        if !self.in_transaction {
            return Ok(());
        }
        let (conn, driver) = match (self.live_conn(), self.driver) {
            (Some(conn), Some(driver)) => (conn, driver),
            _ => {
                self.in_transaction = false;
                return Ok(());
            }
        };
        let result = if driver == Driver::Sqlite {
            conn.exec("COMMIT").await.map(|_| ())
        } else {
            conn.commit().await
        };
        match result {
            Ok(()) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = self.rollback_transaction().await {
                    tracing::warn!(error = %rb, "rollback after failed commit also failed");
                }
                Err(e.into())
            }
        }
    }

    /// Roll back, but only when a transaction is actually open, so a
    /// redundant rollback cannot mask the error that got us here
    async fn rollback_transaction(&mut self) -> Result<(), SessionError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let (conn, driver) = match (self.live_conn(), self.driver) {
            (Some(conn), Some(driver)) => (conn, driver),
            _ => return Ok(()),
        };
        if driver == Driver::Sqlite {
            conn.exec("ROLLBACK").await?;
        } else {
            conn.rollback().await?;
        }
        Ok(())
    }

    async fn read_row(
        &mut self,
        conn: &Arc<dyn Connection>,
        driver: Driver,
        id: &str,
    ) -> Result<Vec<u8>, SessionError> {
        if self.options.lock_mode == LockMode::Advisory {
            let (acquire, release) = driver.advisory_lock_pair(id)?;
            // The result row is intentionally not interpreted.
            conn.query_row(&acquire.sql, &acquire.params).await?;
            self.pending_releases.push(release);
        }

        let transactional = self.options.lock_mode == LockMode::Transactional;
        let select = driver.select_sql(&self.options, transactional);
        let id_param = [SqlValue::Text(id.to_string())];
        loop {
            if let Some(row) = conn.query_row(&select, &id_param).await? {
                if row.i64_at(1)? < Utc::now().timestamp() {
                    self.session_expired = true;
                    return Ok(Vec::new());
                }
                return row.bytes_at(0).map_err(SessionError::from);
            }
            if transactional && driver != Driver::Sqlite {
                // No row to lock yet: insert a placeholder (expiry 0, empty
                // payload) so concurrent transactions block on it.
                match conn
                    .execute(&self.insert_sql(), &placeholder_params(id))
                    .await
                {
                    Ok(_) => return Ok(Vec::new()),
                    Err(e) if e.is_duplicate_key() => {
                        // Another request created the row first. Start over
                        // in a fresh transaction; on PostgreSQL the failed
                        // statement aborted the current one.
                        tracing::debug!(session = id, "placeholder insert collided, retrying");
                        self.rollback_transaction().await?;
                        self.begin_transaction(conn, driver).await?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(Vec::new());
        }
    }

    async fn write_row(
        &self,
        conn: &Arc<dyn Connection>,
        driver: Driver,
        id: &str,
        data: &[u8],
        expiry: i64,
        now: i64,
    ) -> Result<(), SessionError> {
        let version = conn.server_version();
        if let Some(merge) =
            driver.merge_statement(&self.options, version.as_deref(), id, data, expiry, now)
        {
            conn.execute(&merge.sql, &merge.params).await?;
            return Ok(());
        }

        // No atomic merge on this engine/version: UPDATE first, INSERT on
        // miss, and if a concurrent INSERT wins that race, UPDATE again.
        let update = self.update_sql();
        let update_params = [
            SqlValue::Bytes(data.to_vec()),
            SqlValue::Int(expiry),
            SqlValue::Int(now),
            SqlValue::Text(id.to_string()),
        ];
        if conn.execute(&update, &update_params).await? == 0 {
            let insert_params = [
                SqlValue::Text(id.to_string()),
                SqlValue::Bytes(data.to_vec()),
                SqlValue::Int(expiry),
                SqlValue::Int(now),
            ];
            match conn.execute(&self.insert_sql(), &insert_params).await {
                Ok(_) => {}
                Err(e) if e.is_duplicate_key() => {
                    conn.execute(&update, &update_params).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES (?, ?, ?, ?)",
            self.options.table,
            self.options.id_col,
            self.options.data_col,
            self.options.expiry_col,
            self.options.time_col
        )
    }

    fn update_sql(&self) -> String {
        format!(
            "UPDATE {} SET {} = ?, {} = ?, {} = ? WHERE {} = ?",
            self.options.table,
            self.options.data_col,
            self.options.expiry_col,
            self.options.time_col,
            self.options.id_col
        )
    }

    fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} = ?",
            self.options.table, self.options.id_col
        )
    }

    fn purge_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} < ?",
            self.options.table, self.options.expiry_col
        )
    }
}

fn placeholder_params(id: &str) -> [SqlValue; 4] {
    [
        SqlValue::Text(id.to_string()),
        SqlValue::Bytes(Vec::new()),
        SqlValue::Int(0),
        SqlValue::Int(0),
    ]
}

#[async_trait]
impl SaveHandler for SqlSessionHandler {
    async fn open(&mut self, save_path: &str, _session_name: &str) -> Result<(), SessionError> {
        self.session_expired = false;
        self.ensure_conn(Some(save_path)).await.map(|_| ())
    }

    async fn read(&mut self, id: &str) -> Result<Vec<u8>, SessionError> {
        let (conn, driver) = self.ensure_conn(None).await?;
        if self.options.lock_mode == LockMode::Transactional {
            self.begin_transaction(&conn, driver).await?;
        }
        match self.read_row(&conn, driver, id).await {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Err(rb) = self.rollback_transaction().await {
                    tracing::warn!(error = %rb, "rollback after failed read also failed");
                }
                Err(e)
            }
        }
    }

    async fn write(&mut self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        let (conn, driver) = self.ensure_conn(None).await?;
        let now = Utc::now().timestamp();
        let expiry = now + self.options.max_lifetime.seconds();
        match self.write_row(&conn, driver, id, data, expiry, now).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(rb) = self.rollback_transaction().await {
                    tracing::warn!(error = %rb, "rollback after failed write also failed");
                }
                Err(e)
            }
        }
    }

    async fn destroy(&mut self, id: &str) -> Result<(), SessionError> {
        let (conn, _) = self.ensure_conn(None).await?;
        match conn
            .execute(&self.delete_sql(), &[SqlValue::Text(id.to_string())])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(rb) = self.rollback_transaction().await {
                    tracing::warn!(error = %rb, "rollback after failed destroy also failed");
                }
                Err(e.into())
            }
        }
    }

    /// The purge runs at `close`, outside the session's critical section,
    /// so the count of purged rows is not yet known here; a conservative
    /// constant is returned for interface compatibility.
    async fn gc(&mut self, _max_lifetime: i64) -> Result<u64, SessionError> {
        self.gc_called = true;
        Ok(1)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.commit_transaction().await?;

        if !self.pending_releases.is_empty() {
            if let Some(conn) = self.live_conn() {
                for stmt in std::mem::take(&mut self.pending_releases) {
                    conn.query_row(&stmt.sql, &stmt.params).await?;
                }
            }
        }

        if self.gc_called {
            self.gc_called = false;
            if let Some(conn) = self.live_conn() {
                let purged = conn
                    .execute(&self.purge_sql(), &[SqlValue::Int(Utc::now().timestamp())])
                    .await?;
                tracing::debug!(purged, "expired sessions removed");
            }
        }

        if let Gateway::Lazy { live, .. } = &mut self.gateway {
            if live.take().is_some() {
                self.driver = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockMode, SessionOptions};
    use crate::db::{DbError, MemoryEngine, Row};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::time::Duration;

    fn options(lock_mode: LockMode) -> SessionOptions {
        SessionOptions::new().with_lock_mode(lock_mode)
    }

    fn handler(engine: &MemoryEngine, opts: SessionOptions) -> SqlSessionHandler {
        SqlSessionHandler::new(engine.connection(), opts).unwrap()
    }

    fn ready_engine(driver: Driver) -> MemoryEngine {
        let engine = MemoryEngine::new(driver);
        engine.create_table("sessions");
        engine
    }

    #[tokio::test]
    async fn create_table_bootstraps_schema() {
        let engine = MemoryEngine::new(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::None));
        h.create_table().await.unwrap();

        h.open("", "s").await.unwrap();
        h.write("abc", b"v").await.unwrap();
        h.close().await.unwrap();
        assert_eq!(engine.row_count("sessions"), 1);

        // "table already exists" surfaces to the caller verbatim.
        let err = h.create_table().await.unwrap_err();
        assert!(matches!(err, SessionError::Database(ref e) if e.sqlstate.as_deref() == Some("42S01")));
    }

    #[tokio::test]
    async fn new_session_lifecycle() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::Transactional));

        h.open("", "s").await.unwrap();
        let data = h.read("abc").await.unwrap();
        assert!(data.is_empty());
        assert!(!h.is_session_expired());

        h.write("abc", b"\x00\x01data").await.unwrap();
        h.close().await.unwrap();
        assert!(!h.in_transaction);

        h.open("", "s").await.unwrap();
        assert_eq!(h.read("abc").await.unwrap(), b"\x00\x01data");
        h.close().await.unwrap();
    }

    #[tokio::test]
    async fn payload_roundtrip_16k() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::None));
        let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 256) as u8).collect();

        h.open("", "s").await.unwrap();
        h.write("big", &payload).await.unwrap();
        h.close().await.unwrap();

        h.open("", "s").await.unwrap();
        assert_eq!(h.read("big").await.unwrap(), payload);
        h.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_stamps_expiry_from_max_lifetime() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::None).with_max_lifetime(120));

        h.open("", "s").await.unwrap();
        let before = Utc::now().timestamp();
        h.write("abc", b"v").await.unwrap();
        let after = Utc::now().timestamp();
        h.close().await.unwrap();

        let (_, expiry, time) = engine.raw_row("sessions", "abc").unwrap();
        assert!(expiry >= before + 120 && expiry <= after + 120);
        assert!(time >= before && time <= after);
    }

    #[tokio::test]
    async fn expired_session_yields_empty_payload() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::None).with_max_lifetime(-5));

        h.open("", "s").await.unwrap();
        h.write("stale", b"v").await.unwrap();
        h.close().await.unwrap();

        h.open("", "s").await.unwrap();
        assert!(h.read("stale").await.unwrap().is_empty());
        assert!(h.is_session_expired());
        h.close().await.unwrap();

        // The flag resets when the next request opens.
        h.open("", "s").await.unwrap();
        assert!(!h.is_session_expired());
        h.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_write_overwrites_on_every_merge_flavor() {
        for engine in [
            ready_engine(Driver::MySql),
            ready_engine(Driver::Sqlite),
            ready_engine(Driver::Postgres),
            ready_engine(Driver::Postgres).with_server_version("9.4.26"),
        ] {
            let mut h = handler(&engine, options(LockMode::None));
            h.open("", "s").await.unwrap();
            h.write("abc", b"first").await.unwrap();
            h.write("abc", b"second").await.unwrap();
            h.close().await.unwrap();
            let (data, _, _) = engine.raw_row("sessions", "abc").unwrap();
            assert_eq!(data, b"second");
            assert_eq!(engine.row_count("sessions"), 1);
        }
    }

    #[tokio::test]
    async fn update_insert_fallback_handles_fresh_session() {
        // PostgreSQL before 9.5 has no ON CONFLICT: the write path must go
        // UPDATE (0 rows) then INSERT.
        let engine = ready_engine(Driver::Postgres).with_server_version("9.4.26");
        let mut h = handler(&engine, options(LockMode::None));
        h.open("", "s").await.unwrap();
        h.write("fresh", b"v").await.unwrap();
        h.close().await.unwrap();
        let (data, _, _) = engine.raw_row("sessions", "fresh").unwrap();
        assert_eq!(data, b"v");
    }

    /// Injects a concurrent writer between the handler's UPDATE miss and its
    /// INSERT, forcing the duplicate-key retry back onto UPDATE.
    struct RacingConn {
        inner: Arc<dyn Connection>,
        engine: MemoryEngine,
        raced: AtomicBool,
    }

    #[async_trait]
    impl Connection for RacingConn {
        fn driver(&self) -> &str {
            self.inner.driver()
        }
        fn server_version(&self) -> Option<String> {
            self.inner.server_version()
        }
        async fn exec(&self, sql: &str) -> Result<u64, DbError> {
            self.inner.exec(sql).await
        }
        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
            if sql.starts_with("INSERT INTO") && !self.raced.swap(true, Ordering::SeqCst) {
                if let Some(SqlValue::Text(id)) = params.first() {
                    self.engine.insert_row(
                        "sessions",
                        id,
                        b"concurrent",
                        Utc::now().timestamp() + 100,
                        0,
                    );
                }
            }
            self.inner.execute(sql, params).await
        }
        async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, DbError> {
            self.inner.query_row(sql, params).await
        }
        async fn begin(&self) -> Result<(), DbError> {
            self.inner.begin().await
        }
        async fn commit(&self) -> Result<(), DbError> {
            self.inner.commit().await
        }
        async fn rollback(&self) -> Result<(), DbError> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn insert_race_falls_back_to_update() {
        let engine = ready_engine(Driver::Postgres).with_server_version("9.4.26");
        let conn = Arc::new(RacingConn {
            inner: engine.connection(),
            engine: engine.clone(),
            raced: AtomicBool::new(false),
        });
        let mut h = SqlSessionHandler::new(conn, options(LockMode::None)).unwrap();

        h.open("", "s").await.unwrap();
        h.write("contested", b"ours").await.unwrap();
        h.close().await.unwrap();

        // The duplicate-key error never surfaced, and our write won.
        let (data, _, _) = engine.raw_row("sessions", "contested").unwrap();
        assert_eq!(data, b"ours");
    }

    #[tokio::test]
    async fn transactional_read_inserts_placeholder() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::Transactional));

        h.open("", "s").await.unwrap();
        assert!(h.read("fresh").await.unwrap().is_empty());
        assert!(!h.is_session_expired());
        assert!(h.in_transaction);

        // The placeholder row exists so concurrent transactions can block on it.
        let (data, expiry, _) = engine.raw_row("sessions", "fresh").unwrap();
        assert!(data.is_empty());
        assert_eq!(expiry, 0);

        h.write("fresh", b"v").await.unwrap();
        h.close().await.unwrap();
        assert!(!h.in_transaction);
        let (data, expiry, _) = engine.raw_row("sessions", "fresh").unwrap();
        assert_eq!(data, b"v");
        assert!(expiry > 0);
    }

    #[tokio::test]
    async fn placeholder_read_reports_expired() {
        // A placeholder left by a concurrent first-touch reads as an expired
        // session: empty payload, expired flag set.
        let engine = ready_engine(Driver::MySql);
        engine.insert_row("sessions", "held", b"", 0, 0);
        let mut h = handler(&engine, options(LockMode::None));
        h.open("", "s").await.unwrap();
        assert!(h.read("held").await.unwrap().is_empty());
        assert!(h.is_session_expired());
        h.close().await.unwrap();
    }

    async fn assert_serialized(engine: MemoryEngine, lock_mode: LockMode) {
        engine.insert_row("sessions", "k", b"v0", Utc::now().timestamp() + 300, 0);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let engine_a = engine.clone();
        let first = tokio::spawn(async move {
            let mut a = SqlSessionHandler::new(engine_a.connection(), options(lock_mode)).unwrap();
            a.open("", "s").await.unwrap();
            let data = a.read("k").await.unwrap();
            assert_eq!(data, b"v0");
            started_tx.send(()).unwrap();
            // Keep the lock long enough that an unserialized reader would
            // observe v0.
            tokio::time::sleep(Duration::from_millis(100)).await;
            a.write("k", b"from-a").await.unwrap();
            a.close().await.unwrap();
        });

        started_rx.await.unwrap();
        let mut b = SqlSessionHandler::new(engine.connection(), options(lock_mode)).unwrap();
        b.open("", "s").await.unwrap();
        // Blocks until the first request closes.
        let data = b.read("k").await.unwrap();
        assert_eq!(data, b"from-a");
        b.write("k", b"from-b").await.unwrap();
        b.close().await.unwrap();

        first.await.unwrap();
        let (data, _, _) = engine.raw_row("sessions", "k").unwrap();
        assert_eq!(data, b"from-b");
    }

    #[tokio::test]
    async fn transactional_lock_serializes_requests() {
        assert_serialized(ready_engine(Driver::MySql), LockMode::Transactional).await;
        assert_serialized(ready_engine(Driver::Postgres), LockMode::Transactional).await;
    }

    #[tokio::test]
    async fn advisory_lock_serializes_requests() {
        assert_serialized(ready_engine(Driver::MySql), LockMode::Advisory).await;
        assert_serialized(ready_engine(Driver::Postgres), LockMode::Advisory).await;
    }

    #[tokio::test]
    async fn sqlite_transaction_reserves_database() {
        let engine = ready_engine(Driver::Sqlite);
        engine.insert_row("sessions", "k1", b"a", Utc::now().timestamp() + 300, 0);
        engine.insert_row("sessions", "k2", b"b", Utc::now().timestamp() + 300, 0);

        let mut a = handler(&engine, options(LockMode::Transactional));
        a.open("", "s").await.unwrap();
        a.read("k1").await.unwrap();

        let engine_b = engine.clone();
        let waiter = tokio::spawn(async move {
            let mut b =
                SqlSessionHandler::new(engine_b.connection(), options(LockMode::Transactional))
                    .unwrap();
            b.open("", "s").await.unwrap();
            // Different key, same database: BEGIN IMMEDIATE still blocks.
            b.read("k2").await.unwrap();
            b.close().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        a.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("second request should proceed after close")
            .unwrap();
    }

    #[tokio::test]
    async fn advisory_releases_drain_on_close() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::Advisory));

        h.open("", "s").await.unwrap();
        h.read("abc").await.unwrap();
        assert_eq!(engine.advisory_held(), 1);

        h.close().await.unwrap();
        assert_eq!(engine.advisory_held(), 0);
        assert!(h.pending_releases.is_empty());
    }

    #[tokio::test]
    async fn advisory_on_sqlite_is_rejected() {
        let engine = ready_engine(Driver::Sqlite);
        let mut h = handler(&engine, options(LockMode::Advisory));
        h.open("", "s").await.unwrap();
        let err = h.read("abc").await.unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let engine = ready_engine(Driver::MySql);
        let mut h = handler(&engine, options(LockMode::None));

        h.open("", "s").await.unwrap();
        h.write("abc", b"v").await.unwrap();
        h.destroy("abc").await.unwrap();
        h.destroy("abc").await.unwrap();
        assert!(h.read("abc").await.unwrap().is_empty());
        assert!(!h.is_session_expired());
        h.close().await.unwrap();
    }

    #[tokio::test]
    async fn gc_is_deferred_to_close() {
        let engine = ready_engine(Driver::MySql);
        let lifetime = Arc::new(AtomicI64::new(0));
        let hook = Arc::clone(&lifetime);
        let opts = options(LockMode::None)
            .with_max_lifetime_provider(Arc::new(move || hook.load(Ordering::SeqCst)));
        let mut h = handler(&engine, opts);

        h.open("", "s").await.unwrap();
        lifetime.store(-10, Ordering::SeqCst);
        h.write("dead", b"a").await.unwrap();
        lifetime.store(-5, Ordering::SeqCst);
        h.write("deader", b"b").await.unwrap();
        lifetime.store(100, Ordering::SeqCst);
        h.write("alive", b"c").await.unwrap();

        assert!(h.gc(1440).await.unwrap() > 0);
        // Nothing is purged inside the request.
        assert_eq!(engine.row_count("sessions"), 3);

        h.close().await.unwrap();
        assert_eq!(engine.row_count("sessions"), 1);
        assert!(engine.raw_row("sessions", "alive").is_some());

        // The flag does not stick to the next request.
        engine.insert_row("sessions", "dead2", b"x", 1, 0);
        h.open("", "s").await.unwrap();
        h.close().await.unwrap();
        assert_eq!(engine.row_count("sessions"), 2);
    }

    /// First session SELECT misses even though the row exists, reproducing
    /// the window where a concurrent request inserts the placeholder between
    /// our SELECT and INSERT.
    struct FirstMissConn {
        inner: Arc<dyn Connection>,
        missed: AtomicBool,
    }

    #[async_trait]
    impl Connection for FirstMissConn {
        fn driver(&self) -> &str {
            self.inner.driver()
        }
        fn server_version(&self) -> Option<String> {
            self.inner.server_version()
        }
        async fn exec(&self, sql: &str) -> Result<u64, DbError> {
            self.inner.exec(sql).await
        }
        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
            self.inner.execute(sql, params).await
        }
        async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, DbError> {
            if sql.contains(" FROM ") && !self.missed.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.query_row(sql, params).await
        }
        async fn begin(&self) -> Result<(), DbError> {
            self.inner.begin().await
        }
        async fn commit(&self) -> Result<(), DbError> {
            self.inner.commit().await
        }
        async fn rollback(&self) -> Result<(), DbError> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn placeholder_collision_retries_and_reads_winner() {
        let engine = ready_engine(Driver::MySql);
        engine.insert_row("sessions", "new", b"winner", Utc::now().timestamp() + 300, 0);
        let conn = Arc::new(FirstMissConn {
            inner: engine.connection(),
            missed: AtomicBool::new(false),
        });
        let mut h = SqlSessionHandler::new(conn, options(LockMode::Transactional)).unwrap();

        h.open("", "s").await.unwrap();
        // SELECT misses, INSERT hits the winner's row, the handler rolls
        // back, reopens the transaction and re-reads.
        assert_eq!(h.read("new").await.unwrap(), b"winner");
        assert!(h.in_transaction);
        h.close().await.unwrap();
    }

    /// Fails every UPDATE with a non-duplicate SQLSTATE.
    struct FailingUpdateConn {
        inner: Arc<dyn Connection>,
    }

    #[async_trait]
    impl Connection for FailingUpdateConn {
        fn driver(&self) -> &str {
            self.inner.driver()
        }
        fn server_version(&self) -> Option<String> {
            self.inner.server_version()
        }
        async fn exec(&self, sql: &str) -> Result<u64, DbError> {
            self.inner.exec(sql).await
        }
        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
            if sql.starts_with("UPDATE") {
                return Err(DbError::with_sqlstate("42000", "induced failure"));
            }
            self.inner.execute(sql, params).await
        }
        async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, DbError> {
            self.inner.query_row(sql, params).await
        }
        async fn begin(&self) -> Result<(), DbError> {
            self.inner.begin().await
        }
        async fn commit(&self) -> Result<(), DbError> {
            self.inner.commit().await
        }
        async fn rollback(&self) -> Result<(), DbError> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_propagates() {
        let engine = ready_engine(Driver::Postgres).with_server_version("9.4.26");
        let conn = Arc::new(FailingUpdateConn {
            inner: engine.connection(),
        });
        let mut h = SqlSessionHandler::new(conn, options(LockMode::Transactional)).unwrap();

        h.open("", "s").await.unwrap();
        h.read("abc").await.unwrap();
        assert!(h.in_transaction);

        let err = h.write("abc", b"v").await.unwrap_err();
        assert!(matches!(err, SessionError::Database(ref e) if e.sqlstate.as_deref() == Some("42000")));
        // Transaction hygiene: the failure left no transaction open.
        assert!(!h.in_transaction);
        h.close().await.unwrap();
    }

    /// Fails the first native commit.
    struct FailingCommitConn {
        inner: Arc<dyn Connection>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Connection for FailingCommitConn {
        fn driver(&self) -> &str {
            self.inner.driver()
        }
        fn server_version(&self) -> Option<String> {
            self.inner.server_version()
        }
        async fn exec(&self, sql: &str) -> Result<u64, DbError> {
            self.inner.exec(sql).await
        }
        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
            self.inner.execute(sql, params).await
        }
        async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, DbError> {
            self.inner.query_row(sql, params).await
        }
        async fn begin(&self) -> Result<(), DbError> {
            self.inner.begin().await
        }
        async fn commit(&self) -> Result<(), DbError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(DbError::new("connection gone"));
            }
            self.inner.commit().await
        }
        async fn rollback(&self) -> Result<(), DbError> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_and_propagates() {
        let engine = ready_engine(Driver::MySql);
        let conn = Arc::new(FailingCommitConn {
            inner: engine.connection(),
            failed: AtomicBool::new(false),
        });
        let mut h = SqlSessionHandler::new(conn, options(LockMode::Transactional)).unwrap();

        h.open("", "s").await.unwrap();
        h.read("abc").await.unwrap();
        let err = h.close().await.unwrap_err();
        assert!(matches!(err, SessionError::Database(_)));
        assert!(!h.in_transaction);
    }

    /// Minimal connection stub for attribute-level tests.
    struct StubConn {
        tag: &'static str,
        strict: bool,
    }

    #[async_trait]
    impl Connection for StubConn {
        fn driver(&self) -> &str {
            self.tag
        }
        fn server_version(&self) -> Option<String> {
            None
        }
        fn strict_errors(&self) -> bool {
            self.strict
        }
        async fn exec(&self, _sql: &str) -> Result<u64, DbError> {
            Err(DbError::new("stub"))
        }
        async fn execute(&self, _sql: &str, _params: &[SqlValue]) -> Result<u64, DbError> {
            Err(DbError::new("stub"))
        }
        async fn query_row(
            &self,
            _sql: &str,
            _params: &[SqlValue],
        ) -> Result<Option<Row>, DbError> {
            Err(DbError::new("stub"))
        }
        async fn begin(&self) -> Result<(), DbError> {
            Err(DbError::new("stub"))
        }
        async fn commit(&self) -> Result<(), DbError> {
            Err(DbError::new("stub"))
        }
        async fn rollback(&self) -> Result<(), DbError> {
            Err(DbError::new("stub"))
        }
    }

    #[tokio::test]
    async fn unknown_driver_tag_is_rejected() {
        let conn = Arc::new(StubConn {
            tag: "ibm",
            strict: true,
        });
        let mut h = SqlSessionHandler::new(conn, options(LockMode::None)).unwrap();
        let err = h.open("", "s").await.unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedDriver(tag) if tag == "ibm"));
    }

    #[tokio::test]
    async fn lax_error_mode_is_rejected() {
        let conn = Arc::new(StubConn {
            tag: "mysql",
            strict: false,
        });
        let err = SqlSessionHandler::new(conn, options(LockMode::None)).unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[tokio::test]
    async fn lazy_gateway_reconnects_per_request() {
        let engine = ready_engine(Driver::MySql);
        let mut h = SqlSessionHandler::with_connector(
            Arc::new(engine.clone()),
            Some("mysql:host=localhost".to_string()),
            options(LockMode::None),
        );

        h.open("", "s").await.unwrap();
        h.write("abc", b"v").await.unwrap();
        h.close().await.unwrap();
        match &h.gateway {
            Gateway::Lazy { live, .. } => assert!(live.is_none()),
            Gateway::Injected(_) => panic!("expected lazy gateway"),
        }

        // The next request reconnects; the engine still has the data.
        h.open("", "s").await.unwrap();
        assert_eq!(h.read("abc").await.unwrap(), b"v");
        h.close().await.unwrap();
    }

    #[tokio::test]
    async fn save_path_serves_as_dsn_fallback() {
        let engine = ready_engine(Driver::MySql);
        let mut h = SqlSessionHandler::with_connector(
            Arc::new(engine.clone()),
            None,
            options(LockMode::None),
        );

        h.open("mysql:host=from-save-path", "s").await.unwrap();
        h.write("abc", b"v").await.unwrap();
        h.close().await.unwrap();
        assert_eq!(engine.row_count("sessions"), 1);
    }

    #[tokio::test]
    async fn missing_dsn_without_open_is_a_configuration_error() {
        let engine = ready_engine(Driver::MySql);
        let mut h = SqlSessionHandler::with_connector(
            Arc::new(engine),
            None,
            options(LockMode::None),
        );
        let err = h.read("abc").await.unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[tokio::test]
    async fn connector_options_are_passed_through() {
        // A connector that records what it was handed.
        struct RecordingConnector {
            engine: MemoryEngine,
            seen: parking_lot::Mutex<Option<(String, Option<String>, Option<String>, usize)>>,
        }

        #[async_trait]
        impl Connector for RecordingConnector {
            async fn connect(
                &self,
                dsn: &str,
                username: Option<&str>,
                password: Option<&str>,
                options: &HashMap<String, String>,
            ) -> Result<Arc<dyn Connection>, DbError> {
                *self.seen.lock() = Some((
                    dsn.to_string(),
                    username.map(str::to_string),
                    password.map(str::to_string),
                    options.len(),
                ));
                Ok(self.engine.connection())
            }
        }

        let engine = ready_engine(Driver::MySql);
        let connector = Arc::new(RecordingConnector {
            engine: engine.clone(),
            seen: parking_lot::Mutex::new(None),
        });
        let opts = options(LockMode::None)
            .with_username("app")
            .with_password("secret")
            .with_connection_option("charset", "utf8mb4");
        let mut h = SqlSessionHandler::with_connector(
            connector.clone(),
            Some("mysql:host=db".to_string()),
            opts,
        );
        h.open("", "s").await.unwrap();

        let seen = connector.seen.lock().clone().unwrap();
        assert_eq!(seen.0, "mysql:host=db");
        assert_eq!(seen.1.as_deref(), Some("app"));
        assert_eq!(seen.2.as_deref(), Some("secret"));
        assert_eq!(seen.3, 1);
    }
}
