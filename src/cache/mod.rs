//! Versioned response cache.
//!
//! This module provides the cache store the mediator and the lifecycle manager share:
//! - Named caches, one per cache version, kept in creation order
//! - Response snapshots keyed by request URL (GET only)
//! - Atomic batch population and atomic sweeps of stale versions
//! - SQLite persistence, or an in-memory store for one-shot runs and tests

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::{AddAllError, CacheLayer};
pub use memory::MemoryStorage;
pub use storage::SqliteStorage;
pub use traits::{CacheStorage, CacheVersion};
