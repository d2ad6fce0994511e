//! Open client contexts and the generation controlling each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Identifier of an open client context (tab, window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
  fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

/// In-process registry of clients. Never persisted.
#[derive(Debug, Default)]
pub struct ClientRegistry {
  clients: Mutex<HashMap<ClientId, Option<String>>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a newly opened client under `controller`, or uncontrolled.
  pub fn register(&self, controller: Option<String>) -> ClientId {
    let id = ClientId::next();
    self.with(|clients| {
      clients.insert(id, controller);
    });
    id
  }

  pub fn unregister(&self, id: ClientId) {
    self.with(|clients| {
      clients.remove(&id);
    });
  }

  /// Put every open client under `generation`. Returns how many were claimed.
  pub fn claim_all(&self, generation: &str) -> usize {
    self.with(|clients| {
      for controller in clients.values_mut() {
        *controller = Some(generation.to_string());
      }
      clients.len()
    })
  }

  /// Generation controlling `id`, if it is registered and claimed.
  pub fn controller(&self, id: ClientId) -> Option<String> {
    self.with(|clients| clients.get(&id).cloned().flatten())
  }

  fn with<T>(&self, f: impl FnOnce(&mut HashMap<ClientId, Option<String>>) -> T) -> T {
    // The map is always left consistent, so a poisoned lock is still usable.
    let mut clients = self
      .clients
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut clients)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_clients_start_uncontrolled() {
    let registry = ClientRegistry::new();
    let id = registry.register(None);
    assert_eq!(registry.controller(id), None);
    assert_eq!(registry.claim_all("app-v1"), 1);
  }

  #[test]
  fn test_client_registered_under_controller() {
    let registry = ClientRegistry::new();
    let id = registry.register(Some("app-v1".to_string()));
    assert_eq!(registry.controller(id).as_deref(), Some("app-v1"));
  }

  #[test]
  fn test_claim_all_controls_every_client() {
    let registry = ClientRegistry::new();
    let a = registry.register(None);
    let b = registry.register(None);

    assert_eq!(registry.claim_all("app-v1"), 2);
    assert_eq!(registry.controller(a).as_deref(), Some("app-v1"));

    assert_eq!(registry.claim_all("app-v2"), 2);
    assert_eq!(registry.controller(b).as_deref(), Some("app-v2"));
  }

  #[test]
  fn test_unregistered_client_has_no_controller() {
    let registry = ClientRegistry::new();
    let id = registry.register(None);
    registry.claim_all("app-v1");
    registry.unregister(id);
    assert_eq!(registry.controller(id), None);
    assert_eq!(registry.claim_all("app-v1"), 0);
  }
}
