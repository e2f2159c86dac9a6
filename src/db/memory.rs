//! In-memory database engine
//!
//! This is primarily for development and testing: it implements the
//! connection interface over process-local maps, so the handler can be
//! exercised without a database server. It understands the statement shapes
//! the dialect module emits for the engines it impersonates (mysql, pgsql,
//! sqlite) and models the behavior the handler depends on:
//!
//! - unique session ids, with SQLSTATE class-23 errors on duplicate inserts
//! - row locks for `FOR UPDATE` reads and transactional writes, held until
//!   commit or rollback; waiters really block
//! - SQLite's reserved-database lock for `BEGIN IMMEDIATE`
//! - advisory locks (`GET_LOCK`/`RELEASE_LOCK`, `pg_advisory_lock`/`unlock`)
//!   including the 50-second `GET_LOCK` timeout
//! - rollback via an undo log
//!
//! Warning: not suitable for production use. Sessions are lost on restart
//! and are not shared across processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;

use super::traits::{Connection, Connector, DbError, Row, SqlValue};
use crate::dialect::Driver;

/// Upper bound on any lock wait, standing in for the engine's
/// lock-wait timeout
const LOCK_WAIT: Duration = Duration::from_secs(55);

/// `GET_LOCK` timeout used by the advisory acquire statement
const GET_LOCK_WAIT: Duration = Duration::from_secs(50);

#[derive(Clone)]
struct StoredRow {
    data: Vec<u8>,
    expiry: i64,
    time: i64,
}

type RowKey = (String, String);

struct EngineInner {
    driver: Driver,
    server_version: Mutex<Option<String>>,
    tables: Mutex<HashMap<String, HashMap<String, StoredRow>>>,
    row_locks: Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>,
    advisory_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// SQLite's reserved lock: one writing transaction per database
    reserved: Arc<AsyncMutex<()>>,
}

/// Process-local database engine shared by every connection it hands out
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl MemoryEngine {
    /// Create an engine impersonating the given driver, with a plausible
    /// default server version
    pub fn new(driver: Driver) -> Self {
        let version = match driver {
            Driver::MySql => "8.0.36",
            Driver::Postgres => "16.2",
            Driver::Sqlite => "3.45.1",
            Driver::Oracle => "19.0",
            Driver::SqlServer => "15.0.2000",
        };
        MemoryEngine {
            inner: Arc::new(EngineInner {
                driver,
                server_version: Mutex::new(Some(version.to_string())),
                tables: Mutex::new(HashMap::new()),
                row_locks: Mutex::new(HashMap::new()),
                advisory_locks: Mutex::new(HashMap::new()),
                reserved: Arc::new(AsyncMutex::new(())),
            }),
        }
    }

    /// Override the reported server version (e.g. "9.4.26" to exercise the
    /// pre-9.5 PostgreSQL paths)
    pub fn with_server_version<S: Into<String>>(self, version: S) -> Self {
        *self.inner.server_version.lock() = Some(version.into());
        self
    }

    /// Open a connection to this engine
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            engine: Arc::clone(&self.inner),
            state: AsyncMutex::new(ConnState::default()),
        }
    }

    /// Open a connection behind the trait object the handler consumes
    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::new(self.connect())
    }

    /// Create an empty table directly (setup shortcut for tests and demos)
    pub fn create_table(&self, name: &str) {
        self.inner
            .tables
            .lock()
            .entry(name.to_string())
            .or_default();
    }

    /// Insert or overwrite a row directly, creating the table if needed
    pub fn insert_row(&self, table: &str, id: &str, data: &[u8], expiry: i64, time: i64) {
        self.inner
            .tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredRow {
                    data: data.to_vec(),
                    expiry,
                    time,
                },
            );
    }

    /// Number of rows currently stored in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .lock()
            .get(table)
            .map_or(0, HashMap::len)
    }

    /// Raw (data, expiry, time) for one row
    pub fn raw_row(&self, table: &str, id: &str) -> Option<(Vec<u8>, i64, i64)> {
        self.inner
            .tables
            .lock()
            .get(table)?
            .get(id)
            .map(|row| (row.data.clone(), row.expiry, row.time))
    }

    /// Number of advisory locks currently held across all connections
    pub fn advisory_held(&self) -> usize {
        self.inner
            .advisory_locks
            .lock()
            .values()
            .filter(|lock| lock.try_lock().is_err())
            .count()
    }
}

impl Clone for MemoryEngine {
    fn clone(&self) -> Self {
        MemoryEngine {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Connector for MemoryEngine {
    async fn connect(
        &self,
        _dsn: &str,
        _username: Option<&str>,
        _password: Option<&str>,
        _options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError> {
        Ok(self.connection())
    }
}

#[derive(Default)]
struct ConnState {
    in_tx: bool,
    row_guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    reserved_guard: Option<OwnedMutexGuard<()>>,
    advisory_guards: HashMap<String, OwnedMutexGuard<()>>,
    /// Prior row values, replayed in reverse on rollback; `None` marks a row
    /// that did not exist
    undo: Vec<(RowKey, Option<StoredRow>)>,
}

enum Outcome {
    Count(u64),
    Fetched(Option<Row>),
}

/// One connection to a [`MemoryEngine`]
pub struct MemoryConnection {
    engine: Arc<EngineInner>,
    state: AsyncMutex<ConnState>,
}

impl MemoryConnection {
    fn duplicate_error(&self, id: &str) -> DbError {
        match self.engine.driver {
            Driver::Postgres => DbError::with_sqlstate(
                "23505",
                format!("duplicate key value violates unique constraint ({})", id),
            ),
            _ => DbError::with_sqlstate("23000", format!("duplicate entry '{}'", id)),
        }
    }

    fn row_mutex(&self, key: &RowKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.engine
                .row_locks
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Take the row lock for this transaction, blocking on other holders
    async fn lock_row(&self, state: &mut ConnState, key: RowKey) -> Result<(), DbError> {
        if !state.in_tx || state.row_guards.contains_key(&key) {
            return Ok(());
        }
        let mutex = self.row_mutex(&key);
        let guard = timeout(LOCK_WAIT, mutex.lock_owned())
            .await
            .map_err(|_| DbError::with_sqlstate("HYT00", "lock wait timeout exceeded"))?;
        state.row_guards.insert(key, guard);
        Ok(())
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut HashMap<String, StoredRow>) -> T,
    ) -> Result<T, DbError> {
        let mut tables = self.engine.tables.lock();
        match tables.get_mut(table) {
            Some(rows) => Ok(f(rows)),
            None => Err(DbError::with_sqlstate(
                "42S02",
                format!("no such table: {}", table),
            )),
        }
    }

    fn record_undo(&self, state: &mut ConnState, key: RowKey, prior: Option<StoredRow>) {
        if state.in_tx {
            state.undo.push((key, prior));
        }
    }

    fn commit_state(&self, state: &mut ConnState) {
        state.in_tx = false;
        state.undo.clear();
        state.row_guards.clear();
        state.reserved_guard = None;
    }

    fn rollback_state(&self, state: &mut ConnState) {
        state.in_tx = false;
        let mut tables = self.engine.tables.lock();
        for ((table, id), prior) in state.undo.drain(..).rev() {
            if let Some(rows) = tables.get_mut(&table) {
                match prior {
                    Some(row) => {
                        rows.insert(id, row);
                    }
                    None => {
                        rows.remove(&id);
                    }
                }
            }
        }
        drop(tables);
        state.row_guards.clear();
        state.reserved_guard = None;
    }

    async fn acquire_advisory(
        &self,
        state: &mut ConnState,
        key: String,
        wait: Duration,
    ) -> Result<bool, DbError> {
        if state.advisory_guards.contains_key(&key) {
            // Re-acquiring a lock this connection already holds succeeds.
            return Ok(true);
        }
        let mutex = Arc::clone(
            self.engine
                .advisory_locks
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        match timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => {
                state.advisory_guards.insert(key, guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn release_advisory(&self, state: &mut ConnState, key: &str) -> bool {
        state.advisory_guards.remove(key).is_some()
    }

    async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<Outcome, DbError> {
        let sql = sql.trim();
        let upper = sql.to_uppercase();
        let mut state = self.state.lock().await;

        if upper.starts_with("CREATE TABLE") {
            let table = token_after(sql, "TABLE ")
                .ok_or_else(|| DbError::new(format!("cannot parse table name: {}", sql)))?;
            let mut tables = self.engine.tables.lock();
            if tables.contains_key(table) {
                return Err(DbError::with_sqlstate(
                    "42S01",
                    format!("table {} already exists", table),
                ));
            }
            tables.insert(table.to_string(), HashMap::new());
            return Ok(Outcome::Count(0));
        }

        if upper.starts_with("SELECT GET_LOCK") {
            let key = text_param(params, 0)?;
            let got = self.acquire_advisory(&mut state, key, GET_LOCK_WAIT).await?;
            return Ok(Outcome::Fetched(Some(Row::new(vec![SqlValue::Int(
                got as i64,
            )]))));
        }
        if upper.starts_with("SELECT RELEASE_LOCK") {
            let key = text_param(params, 0)?;
            let released = self.release_advisory(&mut state, &key);
            return Ok(Outcome::Fetched(Some(Row::new(vec![SqlValue::Int(
                released as i64,
            )]))));
        }
        if upper.starts_with("SELECT PG_ADVISORY_LOCK") {
            let key = advisory_key_string(params)?;
            if !self.acquire_advisory(&mut state, key, LOCK_WAIT).await? {
                return Err(DbError::with_sqlstate("HYT00", "lock wait timeout exceeded"));
            }
            return Ok(Outcome::Fetched(Some(Row::new(vec![SqlValue::Int(1)]))));
        }
        if upper.starts_with("SELECT PG_ADVISORY_UNLOCK") {
            let key = advisory_key_string(params)?;
            let released = self.release_advisory(&mut state, &key);
            return Ok(Outcome::Fetched(Some(Row::new(vec![SqlValue::Int(
                released as i64,
            )]))));
        }

        if upper.starts_with("SELECT") {
            let table = token_after(sql, " FROM ")
                .ok_or_else(|| DbError::new(format!("cannot parse table name: {}", sql)))?
                .to_string();
            let id = text_param(params, 0)?;
            let locking = upper.contains("FOR UPDATE") || upper.contains("UPDLOCK");
            let exists = self.with_table(&table, |rows| rows.contains_key(&id))?;
            if exists && locking {
                self.lock_row(&mut state, (table.clone(), id.clone())).await?;
            }
            let row = self.with_table(&table, |rows| {
                rows.get(&id).map(|row| {
                    Row::new(vec![
                        SqlValue::Bytes(row.data.clone()),
                        SqlValue::Int(row.expiry),
                        SqlValue::Int(row.time),
                    ])
                })
            })?;
            return Ok(Outcome::Fetched(row));
        }

        if upper.starts_with("MERGE INTO") {
            return Err(DbError::new(
                "MERGE is not supported by the in-memory engine",
            ));
        }

        if upper.starts_with("INSERT OR REPLACE INTO")
            || (upper.starts_with("INSERT INTO")
                && (upper.contains("ON DUPLICATE KEY") || upper.contains("ON CONFLICT")))
        {
            let table = token_after(sql, " INTO ")
                .ok_or_else(|| DbError::new(format!("cannot parse table name: {}", sql)))?
                .to_string();
            let (id, row) = row_params(params)?;
            let key = (table.clone(), id.clone());
            self.lock_row(&mut state, key.clone()).await?;
            let prior = self.with_table(&table, |rows| rows.insert(id, row))?;
            self.record_undo(&mut state, key, prior);
            return Ok(Outcome::Count(1));
        }

        if upper.starts_with("INSERT INTO") {
            let table = token_after(sql, " INTO ")
                .ok_or_else(|| DbError::new(format!("cannot parse table name: {}", sql)))?
                .to_string();
            let (id, row) = row_params(params)?;
            let key = (table.clone(), id.clone());
            // Serialize inserters through the row lock: a duplicate insert
            // blocks on the holder, like a real engine, and reports the
            // conflict once the holder releases. A lock this transaction
            // already holds (e.g. after deleting the row) is not re-taken.
            let guard = if state.row_guards.contains_key(&key) {
                None
            } else {
                let mutex = self.row_mutex(&key);
                Some(
                    timeout(LOCK_WAIT, mutex.lock_owned())
                        .await
                        .map_err(|_| DbError::with_sqlstate("HYT00", "lock wait timeout exceeded"))?,
                )
            };
            let exists = self.with_table(&table, |rows| rows.contains_key(&id))?;
            if exists {
                return Err(self.duplicate_error(&id));
            }
            self.with_table(&table, |rows| rows.insert(id, row))?;
            self.record_undo(&mut state, key.clone(), None);
            if state.in_tx {
                if let Some(guard) = guard {
                    state.row_guards.insert(key, guard);
                }
            }
            return Ok(Outcome::Count(1));
        }

        if upper.starts_with("UPDATE") {
            let table = token_after(sql, "UPDATE ")
                .ok_or_else(|| DbError::new(format!("cannot parse table name: {}", sql)))?
                .to_string();
            let id = text_param(params, params.len().saturating_sub(1))?;
            if !self.with_table(&table, |rows| rows.contains_key(&id))? {
                return Ok(Outcome::Count(0));
            }
            let key = (table.clone(), id.clone());
            self.lock_row(&mut state, key.clone()).await?;
            let row = row_params_update(params)?;
            let prior = self.with_table(&table, |rows| {
                rows.get_mut(&id).map(|slot| std::mem::replace(slot, row))
            })?;
            return match prior {
                Some(_) => {
                    self.record_undo(&mut state, key, prior);
                    Ok(Outcome::Count(1))
                }
                // Row vanished while we waited for the lock.
                None => Ok(Outcome::Count(0)),
            };
        }

        if upper.starts_with("DELETE FROM") {
            let table = token_after(sql, " FROM ")
                .ok_or_else(|| DbError::new(format!("cannot parse table name: {}", sql)))?
                .to_string();
            if upper.contains("< ?") {
                // Expiry sweep.
                let cutoff = int_param(params, 0)?;
                let expired: Vec<String> = self.with_table(&table, |rows| {
                    rows.iter()
                        .filter(|(_, row)| row.expiry < cutoff)
                        .map(|(id, _)| id.clone())
                        .collect()
                })?;
                for id in &expired {
                    let prior = self.with_table(&table, |rows| rows.remove(id))?;
                    self.record_undo(&mut state, (table.clone(), id.clone()), prior);
                }
                return Ok(Outcome::Count(expired.len() as u64));
            }
            let id = text_param(params, 0)?;
            let key = (table.clone(), id.clone());
            if self.with_table(&table, |rows| rows.contains_key(&id))? {
                self.lock_row(&mut state, key.clone()).await?;
            }
            let prior = self.with_table(&table, |rows| rows.remove(&id))?;
            let affected = prior.is_some() as u64;
            if prior.is_some() {
                self.record_undo(&mut state, key, prior);
            }
            return Ok(Outcome::Count(affected));
        }

        if upper.starts_with("SET TRANSACTION") {
            return Ok(Outcome::Count(0));
        }

        if upper.starts_with("BEGIN IMMEDIATE") {
            let guard = timeout(LOCK_WAIT, Arc::clone(&self.engine.reserved).lock_owned())
                .await
                .map_err(|_| DbError::with_sqlstate("HY000", "database is locked"))?;
            state.reserved_guard = Some(guard);
            state.in_tx = true;
            return Ok(Outcome::Count(0));
        }
        if upper == "COMMIT" {
            self.commit_state(&mut state);
            return Ok(Outcome::Count(0));
        }
        if upper == "ROLLBACK" {
            self.rollback_state(&mut state);
            return Ok(Outcome::Count(0));
        }

        Err(DbError::new(format!("unrecognized statement: {}", sql)))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn driver(&self) -> &str {
        self.engine.driver.tag()
    }

    fn server_version(&self) -> Option<String> {
        self.engine.server_version.lock().clone()
    }

    async fn exec(&self, sql: &str) -> Result<u64, DbError> {
        match self.run(sql, &[]).await? {
            Outcome::Count(n) => Ok(n),
            Outcome::Fetched(_) => Ok(0),
        }
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        match self.run(sql, params).await? {
            Outcome::Count(n) => Ok(n),
            Outcome::Fetched(_) => Ok(0),
        }
    }

    async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, DbError> {
        match self.run(sql, params).await? {
            Outcome::Fetched(row) => Ok(row),
            Outcome::Count(_) => Ok(None),
        }
    }

    async fn begin(&self) -> Result<(), DbError> {
        self.state.lock().await.in_tx = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        self.commit_state(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        self.rollback_state(&mut state);
        Ok(())
    }
}

/// Next identifier token after `keyword` in `sql`
fn token_after<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let upper = sql.to_uppercase();
    let start = upper.find(keyword)? + keyword.len();
    let rest = sql[start..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn text_param(params: &[SqlValue], idx: usize) -> Result<String, DbError> {
    match params.get(idx) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        other => Err(DbError::new(format!(
            "expected text parameter at position {}, got {:?}",
            idx, other
        ))),
    }
}

fn int_param(params: &[SqlValue], idx: usize) -> Result<i64, DbError> {
    match params.get(idx) {
        Some(SqlValue::Int(n)) => Ok(*n),
        other => Err(DbError::new(format!(
            "expected integer parameter at position {}, got {:?}",
            idx, other
        ))),
    }
}

fn bytes_param(params: &[SqlValue], idx: usize) -> Result<Vec<u8>, DbError> {
    match params.get(idx) {
        Some(SqlValue::Bytes(b)) => Ok(b.clone()),
        Some(SqlValue::Text(s)) => Ok(s.clone().into_bytes()),
        other => Err(DbError::new(format!(
            "expected binary parameter at position {}, got {:?}",
            idx, other
        ))),
    }
}

/// (id, data, expiry, time) bind order used by INSERT and single-bind merges
fn row_params(params: &[SqlValue]) -> Result<(String, StoredRow), DbError> {
    Ok((
        text_param(params, 0)?,
        StoredRow {
            data: bytes_param(params, 1)?,
            expiry: int_param(params, 2)?,
            time: int_param(params, 3)?,
        },
    ))
}

/// (data, expiry, time, id) bind order used by UPDATE
fn row_params_update(params: &[SqlValue]) -> Result<StoredRow, DbError> {
    Ok(StoredRow {
        data: bytes_param(params, 0)?,
        expiry: int_param(params, 1)?,
        time: int_param(params, 2)?,
    })
}

/// Advisory key string from the integer key or key pair
fn advisory_key_string(params: &[SqlValue]) -> Result<String, DbError> {
    let mut parts = Vec::with_capacity(params.len());
    for idx in 0..params.len() {
        parts.push(int_param(params, idx)?.to_string());
    }
    if parts.is_empty() {
        return Err(DbError::new("advisory lock requires an integer key"));
    }
    Ok(parts.join(":"))
}
