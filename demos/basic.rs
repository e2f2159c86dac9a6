//! Walkthrough of the save-handler lifecycle against the in-memory engine.
//!
//! Run with: cargo run --example basic

use sql_session_store::{
    Driver, LockMode, MemoryEngine, SaveHandler, SessionOptions, SqlSessionHandler,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    // Stands in for a real engine; swap in any Connection implementation.
    let engine = MemoryEngine::new(Driver::MySql);

    let options = SessionOptions::new()
        .with_lock_mode(LockMode::Transactional)
        .with_max_lifetime(1440);
    let mut handler = SqlSessionHandler::new(engine.connection(), options)?;

    // One-shot schema bootstrap.
    handler.create_table().await?;

    let session_id = Uuid::new_v4().to_string();

    // First request: a session that does not exist yet reads as empty.
    handler.open("", "sid").await?;
    let payload = handler.read(&session_id).await?;
    println!(
        "first read: {} bytes, expired = {}",
        payload.len(),
        handler.is_session_expired()
    );
    handler.write(&session_id, b"\x00\x01 opaque bytes").await?;
    handler.close().await?;

    // Second request sees what the first one stored.
    handler.open("", "sid").await?;
    let payload = handler.read(&session_id).await?;
    println!("second read: {:?}", payload);
    handler.write(&session_id, b"updated").await?;

    // Ask for a purge; it runs at close, outside the critical section.
    handler.gc(1440).await?;
    handler.close().await?;

    println!("rows after gc sweep: {}", engine.row_count("sessions"));
    Ok(())
}
