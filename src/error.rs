//! Error types for the caching engine.

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Errors raised by a cache store backend.
#[derive(Error, Debug)]
pub enum StoreError {
  /// SQLite failure.
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// Header (de)serialization failure.
  #[error("failed to encode stored headers: {0}")]
  Encoding(#[from] serde_json::Error),

  /// Writes only land in generations that were opened first.
  #[error("unknown cache generation: {0}")]
  UnknownGeneration(String),

  #[error("invalid stored timestamp: {0}")]
  Timestamp(#[from] chrono::ParseError),

  #[error("cache lock poisoned")]
  Poisoned,

  /// The blocking task running the store call panicked or was cancelled.
  #[error("store task failed: {0}")]
  Task(#[from] tokio::task::JoinError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Transport-level failures. An HTTP error status is never one of these.
#[derive(Error, Debug)]
pub enum NetworkError {
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("network unreachable: {0}")]
  Unreachable(String),
}

/// Reasons an install attempt did not complete.
#[derive(Error, Debug)]
pub enum PrecacheError {
  #[error("failed to fetch {url}: {source}")]
  Fetch { url: String, source: NetworkError },

  #[error("{url} answered with status {status}")]
  Status { url: String, status: u16 },

  #[error("failed to store precached assets: {0}")]
  Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
  #[error("cannot {event} while {from:?}")]
  InvalidTransition {
    from: LifecycleState,
    event: &'static str,
  },
}

/// Errors surfaced by the engine's install and activate events.
#[derive(Error, Debug)]
pub enum EngineError {
  #[error("install failed: {0}")]
  Install(#[from] PrecacheError),

  #[error("activation failed: {0}")]
  Sweep(StoreError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),
}
