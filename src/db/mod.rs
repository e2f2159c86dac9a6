//! Database interface consumed by the session handler

pub mod memory;
pub mod traits;

// Re-export the public API
pub use memory::{MemoryConnection, MemoryEngine};
pub use traits::{Connection, Connector, DbError, Row, SqlValue};
