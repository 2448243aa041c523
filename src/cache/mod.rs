//! Persistent, release-versioned response caching.
//!
//! This module provides:
//! - `CacheGeneration` / `StoreName`: one "core" and one "dynamic" store per release
//! - `CacheStorage`: the store operations, backed by SQLite in `SqliteStorage`
//! - `CacheLayer`: CacheFirst, NetworkFirst and StaleWhileRevalidate execution

mod entry;
mod generation;
mod layer;
mod storage;

pub use entry::{CacheEntry, CacheResult, CacheSource, EntrySummary};
pub use generation::{CacheGeneration, StoreKind, StoreName};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
