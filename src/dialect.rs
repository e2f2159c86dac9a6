//! Per-driver SQL dialects
//!
//! Every engine difference the session handler has to navigate lives in this
//! module: DDL column types, the row-locking SELECT hint, single-statement
//! merge syntax and the server versions that gate it, and advisory lock
//! statements. The handler itself stays driver-agnostic; it asks the
//! [`Driver`] tag for the SQL it needs.

use serde::{Deserialize, Serialize};

use crate::config::SessionOptions;
use crate::db::SqlValue;
use crate::error::SessionError;

/// Driver tags of the supported engines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Driver {
    /// MySQL / MariaDB ("mysql")
    #[serde(rename = "mysql")]
    MySql,
    /// PostgreSQL ("pgsql")
    #[serde(rename = "pgsql")]
    Postgres,
    /// SQLite ("sqlite")
    #[serde(rename = "sqlite")]
    Sqlite,
    /// Oracle ("oci")
    #[serde(rename = "oci")]
    Oracle,
    /// Microsoft SQL Server ("sqlsrv")
    #[serde(rename = "sqlsrv")]
    SqlServer,
}

/// A SQL string together with its positional bind values
#[derive(Debug, Clone)]
pub struct SqlStatement {
    /// Statement text with `?` placeholders
    pub sql: String,
    /// Bind values in placeholder order
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        SqlStatement {
            sql: sql.into(),
            params,
        }
    }
}

impl Driver {
    /// Resolve a driver tag reported by a connection
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "mysql" => Some(Driver::MySql),
            "pgsql" => Some(Driver::Postgres),
            "sqlite" => Some(Driver::Sqlite),
            "oci" => Some(Driver::Oracle),
            "sqlsrv" => Some(Driver::SqlServer),
            _ => None,
        }
    }

    /// The canonical tag string
    pub fn tag(self) -> &'static str {
        match self {
            Driver::MySql => "mysql",
            Driver::Postgres => "pgsql",
            Driver::Sqlite => "sqlite",
            Driver::Oracle => "oci",
            Driver::SqlServer => "sqlsrv",
        }
    }

    /// DDL for the session table
    ///
    /// Id and payload columns get binary-safe types everywhere a textual
    /// type would normalize case or trailing whitespace.
    pub fn create_table_sql(self, opts: &SessionOptions) -> String {
        let SessionOptions {
            table,
            id_col,
            data_col,
            expiry_col,
            time_col,
            ..
        } = opts;
        match self {
            Driver::MySql => format!(
                "CREATE TABLE {} ({} VARBINARY(128) NOT NULL PRIMARY KEY, \
                 {} BLOB NOT NULL, {} INTEGER UNSIGNED NOT NULL, \
                 {} INTEGER UNSIGNED NOT NULL) COLLATE utf8mb4_bin, ENGINE = InnoDB",
                table, id_col, data_col, expiry_col, time_col
            ),
            Driver::Postgres => format!(
                "CREATE TABLE {} ({} VARCHAR(128) NOT NULL PRIMARY KEY, \
                 {} BYTEA NOT NULL, {} INTEGER NOT NULL, {} INTEGER NOT NULL)",
                table, id_col, data_col, expiry_col, time_col
            ),
            Driver::Sqlite => format!(
                "CREATE TABLE {} ({} TEXT NOT NULL PRIMARY KEY, \
                 {} BLOB NOT NULL, {} INTEGER NOT NULL, {} INTEGER NOT NULL)",
                table, id_col, data_col, expiry_col, time_col
            ),
            Driver::Oracle => format!(
                "CREATE TABLE {} ({} VARCHAR2(128) NOT NULL PRIMARY KEY, \
                 {} BLOB NOT NULL, {} INTEGER NOT NULL, {} INTEGER NOT NULL)",
                table, id_col, data_col, expiry_col, time_col
            ),
            Driver::SqlServer => format!(
                "CREATE TABLE {} ({} VARCHAR(128) NOT NULL PRIMARY KEY, \
                 {} VARBINARY(MAX) NOT NULL, {} INTEGER NOT NULL, {} INTEGER NOT NULL)",
                table, id_col, data_col, expiry_col, time_col
            ),
        }
    }

    /// SELECT used by `read`; `locking` asks for the row-locking form
    ///
    /// SQLite has no row-level locking: its transactional reads rely on
    /// `BEGIN IMMEDIATE` reserving the whole database, so the plain form is
    /// returned even when `locking` is set.
    pub fn select_sql(self, opts: &SessionOptions, locking: bool) -> String {
        let base = format!(
            "SELECT {}, {}, {} FROM {} WHERE {} = ?",
            opts.data_col, opts.expiry_col, opts.time_col, opts.table, opts.id_col
        );
        if !locking {
            return base;
        }
        match self {
            Driver::MySql | Driver::Postgres | Driver::Oracle => format!("{} FOR UPDATE", base),
            Driver::SqlServer => format!(
                "SELECT {}, {}, {} FROM {} WITH (UPDLOCK, ROWLOCK) WHERE {} = ?",
                opts.data_col, opts.expiry_col, opts.time_col, opts.table, opts.id_col
            ),
            Driver::Sqlite => base,
        }
    }

    /// Single-statement merge, where the engine guarantees it is atomic
    ///
    /// Returns `None` when no atomic form exists (PostgreSQL before 9.5,
    /// SQL Server before 2008, or an unreadable server version on a gated
    /// driver); the caller falls back to UPDATE-then-INSERT.
    pub fn merge_statement(
        self,
        opts: &SessionOptions,
        server_version: Option<&str>,
        id: &str,
        data: &[u8],
        expiry: i64,
        now: i64,
    ) -> Option<SqlStatement> {
        let SessionOptions {
            table,
            id_col,
            data_col,
            expiry_col,
            time_col,
            ..
        } = opts;
        let single_bind = || {
            vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Bytes(data.to_vec()),
                SqlValue::Int(expiry),
                SqlValue::Int(now),
            ]
        };
        // MERGE binds the insert and update halves separately.
        let double_bind = || {
            vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Text(id.to_string()),
                SqlValue::Bytes(data.to_vec()),
                SqlValue::Int(expiry),
                SqlValue::Int(now),
                SqlValue::Bytes(data.to_vec()),
                SqlValue::Int(expiry),
                SqlValue::Int(now),
            ]
        };
        match self {
            Driver::MySql => Some(SqlStatement::new(
                format!(
                    "INSERT INTO {t} ({id}, {data}, {expiry}, {time}) VALUES (?, ?, ?, ?) \
                     ON DUPLICATE KEY UPDATE {data} = VALUES({data}), \
                     {expiry} = VALUES({expiry}), {time} = VALUES({time})",
                    t = table,
                    id = id_col,
                    data = data_col,
                    expiry = expiry_col,
                    time = time_col
                ),
                single_bind(),
            )),
            Driver::Sqlite => Some(SqlStatement::new(
                format!(
                    "INSERT OR REPLACE INTO {} ({}, {}, {}, {}) VALUES (?, ?, ?, ?)",
                    table, id_col, data_col, expiry_col, time_col
                ),
                single_bind(),
            )),
            Driver::Postgres => {
                if !version_at_least(server_version?, 9, 5) {
                    return None;
                }
                Some(SqlStatement::new(
                    format!(
                        "INSERT INTO {t} ({id}, {data}, {expiry}, {time}) VALUES (?, ?, ?, ?) \
                         ON CONFLICT ({id}) DO UPDATE SET {data} = EXCLUDED.{data}, \
                         {expiry} = EXCLUDED.{expiry}, {time} = EXCLUDED.{time}",
                        t = table,
                        id = id_col,
                        data = data_col,
                        expiry = expiry_col,
                        time = time_col
                    ),
                    single_bind(),
                ))
            }
            Driver::Oracle => Some(SqlStatement::new(
                format!(
                    "MERGE INTO {t} USING DUAL ON ({id} = ?) \
                     WHEN NOT MATCHED THEN INSERT ({id}, {data}, {expiry}, {time}) \
                     VALUES (?, ?, ?, ?) \
                     WHEN MATCHED THEN UPDATE SET {data} = ?, {expiry} = ?, {time} = ?",
                    t = table,
                    id = id_col,
                    data = data_col,
                    expiry = expiry_col,
                    time = time_col
                ),
                double_bind(),
            )),
            Driver::SqlServer => {
                // MERGE is atomic only from SQL Server 2008 on, and only
                // with the HOLDLOCK hint.
                if !version_at_least(server_version?, 10, 0) {
                    return None;
                }
                Some(SqlStatement::new(
                    format!(
                        "MERGE INTO {t} WITH (HOLDLOCK) USING (SELECT 1 AS dummy) AS src \
                         ON ({t}.{id} = ?) \
                         WHEN NOT MATCHED THEN INSERT ({id}, {data}, {expiry}, {time}) \
                         VALUES (?, ?, ?, ?) \
                         WHEN MATCHED THEN UPDATE SET {data} = ?, {expiry} = ?, {time} = ?;",
                        t = table,
                        id = id_col,
                        data = data_col,
                        expiry = expiry_col,
                        time = time_col
                    ),
                    double_bind(),
                ))
            }
        }
    }

    /// Advisory acquire/release statement pair for one session id
    ///
    /// The acquire and release are both SELECTs whose result row is not
    /// interpreted. The MySQL timeout of 50 seconds matches the default
    /// `innodb_lock_wait_timeout`, so advisory and row-lock waits give up on
    /// the same schedule.
    pub fn advisory_lock_pair(
        self,
        id: &str,
    ) -> Result<(SqlStatement, SqlStatement), SessionError> {
        match self {
            Driver::MySql => {
                // MySQL 5.7.5+ rejects lock names longer than 64 characters.
                let key: String = id.chars().take(64).collect();
                Ok((
                    SqlStatement::new(
                        "SELECT GET_LOCK(?, 50)",
                        vec![SqlValue::Text(key.clone())],
                    ),
                    SqlStatement::new("SELECT RELEASE_LOCK(?)", vec![SqlValue::Text(key)]),
                ))
            }
            Driver::Postgres => Ok(postgres_advisory_pair(id)),
            Driver::Sqlite => Err(SessionError::UnsupportedOperation(
                "SQLite does not support advisory locks".to_string(),
            )),
            Driver::Oracle | Driver::SqlServer => Err(SessionError::UnsupportedOperation(
                format!(
                    "advisory locks are not implemented for driver \"{}\"",
                    self.tag()
                ),
            )),
        }
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// `pg_advisory_lock` takes integer keys, so the session id's hex prefix is
/// converted to one signed 64-bit key (15 hex chars) or, on 32-bit targets,
/// a pair of signed 32-bit keys (7 hex chars each). One fewer hex char than
/// would fill the integer keeps the value in the signed range.
#[cfg(target_pointer_width = "32")]
fn postgres_advisory_pair(id: &str) -> (SqlStatement, SqlStatement) {
    let (key1, key2) = advisory_key_pair(id);
    let params = vec![SqlValue::Int(key1 as i64), SqlValue::Int(key2 as i64)];
    (
        SqlStatement::new("SELECT pg_advisory_lock(?, ?)", params.clone()),
        SqlStatement::new("SELECT pg_advisory_unlock(?, ?)", params),
    )
}

/// See the 32-bit variant for the key layout rationale.
#[cfg(not(target_pointer_width = "32"))]
fn postgres_advisory_pair(id: &str) -> (SqlStatement, SqlStatement) {
    let key = advisory_key(id);
    (
        SqlStatement::new("SELECT pg_advisory_lock(?)", vec![SqlValue::Int(key)]),
        SqlStatement::new("SELECT pg_advisory_unlock(?)", vec![SqlValue::Int(key)]),
    )
}

/// First 15 hex chars of the id as a signed 64-bit key (60 bits used)
#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
fn advisory_key(id: &str) -> i64 {
    hex_prefix_value(id, 15) as i64
}

/// First 7 + next 7 hex chars of the id as a pair of signed 32-bit keys
/// (28 bits used each)
#[cfg_attr(not(target_pointer_width = "32"), allow(dead_code))]
fn advisory_key_pair(id: &str) -> (i32, i32) {
    let hex: Vec<char> = id.chars().filter(char::is_ascii_hexdigit).collect();
    let first: String = hex.iter().take(7).collect();
    let second: String = hex.iter().skip(7).take(7).collect();
    (
        hex_prefix_value(&first, 7) as i32,
        hex_prefix_value(&second, 7) as i32,
    )
}

/// Value of the first `len` hex chars of `s`, skipping non-hex chars the way
/// a tolerant hex conversion does; an id with no hex chars derives 0
fn hex_prefix_value(s: &str, len: usize) -> u64 {
    s.chars()
        .filter(char::is_ascii_hexdigit)
        .take(len)
        .fold(0u64, |acc, c| acc * 16 + c.to_digit(16).unwrap() as u64)
}

/// Lenient "major.minor" comparison over a server version string; anything
/// unparseable compares below every gate
fn version_at_least(version: &str, major: u64, minor: u64) -> bool {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u64>().unwrap_or(0));
    let found_major = match parts.next() {
        Some(m) => m,
        None => return false,
    };
    let found_minor = parts.next().unwrap_or(0);
    (found_major, found_minor) >= (major, minor)
}
