//! Core traits and types for the generation-aware cache.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::StoreError;
use crate::request::{RequestKey, Response};

/// How a lookup matches stored entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
  /// Match on method + path only, discarding the query string
  pub ignore_query: bool,
}

impl MatchOptions {
  pub fn ignoring_query() -> Self {
    Self { ignore_query: true }
  }
}

/// A stored response together with its storage metadata.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// URL the entry was stored under
  pub url: String,
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache store backends.
///
/// Calls are synchronous; async callers go through [`Generation`], which runs
/// them on the blocking pool.
pub trait CacheStore: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  #[allow(dead_code)]
  fn open(&self, generation: &str) -> Result<(), StoreError>;

  /// Look up an entry.
  fn get(
    &self,
    generation: &str,
    key: &RequestKey,
    options: MatchOptions,
  ) -> Result<Option<CachedResponse>, StoreError>;

  /// Store an entry, replacing any previous value under the same key.
  /// Fails with [`StoreError::UnknownGeneration`] if the generation was never opened
  /// or has been deleted.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError>;

  /// Open the generation and store every entry, all or nothing.
  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<(), StoreError>;

  /// Delete a generation and all its entries. Returns whether it existed.
  fn delete(&self, generation: &str) -> Result<bool, StoreError>;

  /// All generation identifiers currently present.
  fn generation_ids(&self) -> Result<BTreeSet<String>, StoreError>;
}

/// Async handle on one generation of a shared store.
pub struct Generation<S: CacheStore> {
  store: Arc<S>,
  id: Arc<str>,
}

impl<S: CacheStore> Generation<S> {
  /// Open (creating if needed) a generation.
  #[allow(dead_code)]
  pub async fn open(store: Arc<S>, id: &str) -> Result<Self, StoreError> {
    let handle = Self::existing(store, id);
    let id = Arc::clone(&handle.id);
    handle.blocking(move |s| s.open(&id)).await?;
    Ok(handle)
  }

  /// Handle on a generation without creating it. Writes fail if it is absent.
  pub fn existing(store: Arc<S>, id: &str) -> Self {
    Self {
      store,
      id: Arc::from(id),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub async fn get(
    &self,
    key: &RequestKey,
    options: MatchOptions,
  ) -> Result<Option<CachedResponse>, StoreError> {
    let id = Arc::clone(&self.id);
    let key = key.clone();
    self.blocking(move |s| s.get(&id, &key, options)).await
  }

  pub async fn put(&self, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let id = Arc::clone(&self.id);
    let key = key.clone();
    let response = response.clone();
    self.blocking(move |s| s.put(&id, &key, &response)).await
  }

  pub async fn put_all(&self, entries: Vec<(RequestKey, Response)>) -> Result<(), StoreError> {
    let id = Arc::clone(&self.id);
    self.blocking(move |s| s.put_all(&id, &entries)).await
  }

  async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
  {
    run_blocking(&self.store, f).await
  }
}

impl<S: CacheStore> Clone for Generation<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      id: Arc::clone(&self.id),
    }
  }
}

/// Run a store call on the blocking pool.
pub async fn run_blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T, StoreError>
where
  S: CacheStore,
  T: Send + 'static,
  F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
{
  let store = Arc::clone(store);
  tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Current generation hit, no network access
  Cache,
  /// Fresh from the network
  Network,
  /// Network unreachable, served the stored shell document
  Shell,
  /// Network unreachable and no shell stored
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::Network => "network",
      Self::Shell => "shell",
      Self::Offline => "offline",
    }
  }
}

/// Response produced by the cache-first strategy.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
}

impl Served {
  pub fn new(response: Response, source: CacheSource) -> Self {
    Self { response, source }
  }
}
