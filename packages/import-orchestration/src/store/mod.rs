//! Shared stores for waiter counters and import state
//!
//! - `MemoryStore`: single-process deployments and tests (DashMap)
//! - `SqliteStore`: several worker processes sharing one database file (sqlx)
//!
//! Both implement `CounterStore` and `StateStore` with the same TTL rules:
//! an expired counter reads as satisfied, an expired state reads as absent.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
