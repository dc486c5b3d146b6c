//! fleetlink: transactional association engine for fleet entities.
//!
//! Devices, installations, contacts and SIM cards are stored independently in a key-value store without joins
//! or foreign keys. This crate links and unlinks them atomically, keeps an append-only history of every
//! transition, and removes or deactivates entities together with their associations.

pub mod audit;
pub mod config;
pub mod engine;
pub mod entities;
pub mod errors;
pub mod id;
pub mod keys;
pub mod registry;
pub mod runtime;
pub mod types;

pub use audit::{AuditSink, LogAuditSink, MemoryAuditSink, NoopAuditSink};
pub use config::{EngineConfig, RedisSettings, RelationSettings, StoreSettings};
pub use engine::{AssociationEngine, CascadeOptions, InvalidReason, InvalidRef, ValidationOutcome};
pub use entities::{EntityPresence, EntityRepo, EntitySource};
pub use errors::FleetError;
pub use keys::KeyScheme;
pub use registry::RelationRegistry;
pub use runtime::{MemoryStore, RedisStore, RetryPolicy, StoreExecutor, StoreStats};
pub use types::*;

// Re-export redis types so users don't need to depend on a specific redis version
pub use redis;
pub use redis::aio::ConnectionManager;

/// Delete all keys matching a pattern (for test cleanup).
///
/// This performs a SCAN + DEL operation to safely delete keys without blocking Redis.
pub async fn cleanup_pattern(conn: &mut ConnectionManager, pattern: &str) -> Result<u64, FleetError> {
    const SCAN_COUNT: usize = 1000;
    let mut cursor: u64 = 0;
    let mut total_deleted: u64 = 0;

    loop {
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;

        if !keys.is_empty() {
            let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(conn).await?;
            total_deleted += deleted;
        }

        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }

    Ok(total_deleted)
}
