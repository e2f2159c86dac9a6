//! # sql-session-store
//!
//! Database-backed session storage with portable concurrency control.
//!
//! This crate persists opaque session payloads in a single table of a
//! relational database (MySQL, PostgreSQL, SQLite, Oracle or SQL Server)
//! and implements the save-handler contract a web request pipeline drives:
//! open, read, write, destroy, gc, close. Each session id behaves as a
//! mutually exclusive critical section spanning read to write, even though
//! every engine exposes different locking primitives and merge syntax.
//!
//! ## Features
//!
//! - **Three lock modes**: row-level transactional locking (the default),
//!   engine advisory locks, or no locking for last-writer-wins setups
//! - **Per-driver SQL dialects**: locking SELECT hints, version-gated
//!   atomic UPSERT/MERGE statements, and binary-safe DDL per engine
//! - **Opaque payloads**: session bytes round-trip untouched, NULs included
//! - **Deferred expiry purge**: `gc` marks, `close` sweeps, so cleanup never
//!   blocks an active session
//! - **Injected connections**: any engine reachable through the small
//!   [`Connection`] trait works, including the bundled in-memory engine for
//!   development and testing
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sql_session_store::{SaveHandler, SessionOptions, SqlSessionHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any Connection implementation works; adapters typically wrap a
//!     // driver crate for the engine in use.
//!     let conn: Arc<dyn sql_session_store::Connection> = my_connection();
//!
//!     let mut handler = SqlSessionHandler::new(conn, SessionOptions::default())?;
//!     handler.create_table().await.ok(); // one-shot bootstrap
//!
//!     handler.open("", "sid").await?;
//!     let payload = handler.read("4f2a…").await?;
//!     // ... request runs, payload is mutated by the host ...
//!     handler.write("4f2a…", &payload).await?;
//!     handler.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod handler;

/// Construction-time options bundle for the handler
pub use config::{LockMode, MaxLifetime, SessionOptions};

/// Connection interface the handler consumes, plus the in-memory engine
pub use db::{Connection, Connector, DbError, MemoryConnection, MemoryEngine, Row, SqlValue};

/// Driver tags and the per-driver SQL they select
pub use dialect::{Driver, SqlStatement};

/// Error taxonomy surfaced by handler operations
pub use error::SessionError;

/// The save-handler contract and its database-backed implementation
pub use handler::{SaveHandler, SqlSessionHandler};
