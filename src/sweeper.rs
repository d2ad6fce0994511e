//! Activation-time removal of stale cache generations.

use std::sync::Arc;
use tracing::info;

use crate::cache::{run_blocking, CacheStore};
use crate::error::StoreError;

pub struct Sweeper<S: CacheStore> {
  store: Arc<S>,
}

impl<S: CacheStore> Sweeper<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  /// Delete every generation except `current`. Returns the deleted ids, sorted.
  ///
  /// Stops at the first failed deletion so the caller never claims clients
  /// while several generations are still reachable.
  pub async fn sweep(&self, current: &str) -> Result<Vec<String>, StoreError> {
    let current = current.to_string();
    let deleted = run_blocking(&self.store, move |store| {
      let mut deleted = Vec::new();
      for id in store.generation_ids()? {
        if id == current {
          continue;
        }
        store.delete(&id)?;
        deleted.push(id);
      }
      Ok(deleted)
    })
    .await?;

    if !deleted.is_empty() {
      info!(?deleted, "swept stale generations");
    }
    Ok(deleted)
  }
}
