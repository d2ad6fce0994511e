//! Generation-aware response cache for offline support.
//!
//! This module provides:
//! - A store of response snapshots grouped into versioned generations
//! - SQLite (durable) and in-memory backends behind one trait
//! - The cache-first serving strategy with shell and offline fallbacks

mod layer;
mod storage;
mod traits;

pub use layer::CacheFirst;
pub use storage::{MemoryStore, SqliteStore};
pub use traits::{run_blocking, CacheStore, Generation, Served};

#[cfg(test)]
pub use layer::OFFLINE_NOTICE;
#[cfg(test)]
pub use traits::{CacheSource, CachedResponse, MatchOptions};
