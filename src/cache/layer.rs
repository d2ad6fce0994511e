//! Cache-first serving strategy with detached write-back.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::traits::{CacheSource, CacheStore, Generation, MatchOptions, Served};
use crate::network::Fetcher;
use crate::request::{Request, RequestKey, Response};

/// Body of the synthetic response returned when neither network nor shell is available.
pub const OFFLINE_NOTICE: &str = "Offline. Open once online to cache.";

/// Cache layer that serves owned requests cache-first.
///
/// 1. Look up the request in the current generation, ignoring the query
/// 2. On a miss, fetch from the network and store a copy in the background
/// 3. On transport failure, serve the stored shell document
/// 4. Without a shell, serve a plain-text offline notice
pub struct CacheFirst<S: CacheStore, N: Fetcher> {
  store: Arc<S>,
  fetcher: Arc<N>,
  /// Key of the shell document used as the offline fallback
  shell: RequestKey,
  /// Store 4xx/5xx responses like any other
  store_error_responses: bool,
  writes: TaskTracker,
  /// Held across close/wait/reopen so concurrent drains cannot reopen under each other
  draining: Mutex<()>,
}

impl<S: CacheStore, N: Fetcher> CacheFirst<S, N> {
  pub fn new(store: Arc<S>, fetcher: Arc<N>, shell: RequestKey) -> Self {
    Self {
      store,
      fetcher,
      shell,
      store_error_responses: true,
      writes: TaskTracker::new(),
      draining: Mutex::new(()),
    }
  }

  pub fn with_store_error_responses(mut self, enabled: bool) -> Self {
    self.store_error_responses = enabled;
    self
  }

  /// Produce a response for an owned request against `generation`.
  pub async fn serve(&self, request: &Request, generation: &str) -> Served {
    let cache = Generation::existing(Arc::clone(&self.store), generation);
    let key = request.key();

    // A lookup error (e.g. the generation was swept mid-request) is a miss.
    match cache.get(&key, MatchOptions::ignoring_query()).await {
      Ok(Some(cached)) => {
        debug!(url = %request.url, stored_url = %cached.url, stored_at = %cached.stored_at, "cache hit");
        return Served::new(cached.response, CacheSource::Cache);
      }
      Ok(None) => debug!(url = %request.url, "cache miss"),
      Err(e) => warn!(url = %request.url, error = %e, "cache lookup failed, treating as miss"),
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_in_background(cache, key, &response);
        Served::new(response, CacheSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network unavailable, falling back");
        self.fallback(&cache).await
      }
    }
  }

  async fn fallback(&self, cache: &Generation<S>) -> Served {
    match cache.get(&self.shell, MatchOptions::ignoring_query()).await {
      Ok(Some(shell)) => return Served::new(shell.response, CacheSource::Shell),
      Ok(None) => {}
      Err(e) => warn!(error = %e, "shell lookup failed"),
    }
    Served::new(offline_notice(), CacheSource::Offline)
  }

  fn store_in_background(&self, cache: Generation<S>, key: RequestKey, response: &Response) {
    if response.is_error() {
      if !self.store_error_responses {
        debug!(url = key.url(), status = response.status, "not storing error response");
        return;
      }
      // Replayed while offline until the next generation.
      warn!(url = key.url(), status = response.status, "storing error response");
    }

    let response = response.clone();
    self.writes.spawn(async move {
      match cache.put(&key, &response).await {
        Ok(()) => debug!(url = key.url(), generation = cache.id(), "stored"),
        Err(e) => warn!(url = key.url(), error = %e, "failed to store response"),
      }
    });
  }

  /// Wait for every background write started so far.
  pub async fn drain_writes(&self) {
    let _draining = self.draining.lock().await;
    self.writes.close();
    self.writes.wait().await;
    self.writes.reopen();
  }
}

/// The synthetic response served when both network and shell are unavailable.
fn offline_notice() -> Response {
  Response::new(200, OFFLINE_NOTICE).with_header("content-type", "text/plain")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use crate::network::testing::FakeFetcher;
  use bytes::Bytes;
  use reqwest::Method;
  use url::Url;

  const GEN: &str = "app-v1";

  fn url(path: &str) -> Url {
    Url::parse("https://app.test/").unwrap().join(path).unwrap()
  }

  fn setup() -> (Arc<MemoryStore>, Arc<FakeFetcher>, CacheFirst<MemoryStore, FakeFetcher>) {
    let store = Arc::new(MemoryStore::new());
    store.open(GEN).unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    let shell = RequestKey::new(&Method::GET, &url("/index.html"));
    let strategy = CacheFirst::new(Arc::clone(&store), Arc::clone(&fetcher), shell);
    (store, fetcher, strategy)
  }

  #[tokio::test]
  async fn test_hit_skips_network() {
    let (store, fetcher, strategy) = setup();
    let key = RequestKey::new(&Method::GET, &url("/app.js"));
    store.put(GEN, &key, &Response::new(200, "cached")).unwrap();

    let served = strategy.serve(&Request::get(url("/app.js?cb=9")), GEN).await;
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, Bytes::from("cached"));
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_miss_fetches_and_caches_round_trip() {
    let (_store, fetcher, strategy) = setup();
    fetcher.respond("https://app.test/words.json", Response::new(200, "[1,2]"));

    let first = strategy.serve(&Request::get(url("/words.json")), GEN).await;
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.response.body, Bytes::from("[1,2]"));

    strategy.drain_writes().await;
    fetcher.go_offline();

    let second = strategy.serve(&Request::get(url("/words.json")), GEN).await;
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response, first.response);
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_error_status_is_cached_as_is() {
    let (store, fetcher, strategy) = setup();
    fetcher.respond("https://app.test/broken", Response::new(500, "boom"));

    let served = strategy.serve(&Request::get(url("/broken")), GEN).await;
    assert_eq!(served.response.status, 500);
    strategy.drain_writes().await;

    let key = RequestKey::new(&Method::GET, &url("/broken"));
    let stored = store.get(GEN, &key, MatchOptions::default()).unwrap().unwrap();
    assert_eq!(stored.response.status, 500);
  }

  #[tokio::test]
  async fn test_error_status_not_cached_when_disabled() {
    let (store, fetcher, strategy) = setup();
    let strategy = strategy.with_store_error_responses(false);
    fetcher.respond("https://app.test/missing", Response::new(404, "nope"));

    let served = strategy.serve(&Request::get(url("/missing")), GEN).await;
    assert_eq!(served.response.status, 404);
    strategy.drain_writes().await;

    let key = RequestKey::new(&Method::GET, &url("/missing"));
    assert!(store.get(GEN, &key, MatchOptions::default()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_serves_shell() {
    let (store, fetcher, strategy) = setup();
    let shell = RequestKey::new(&Method::GET, &url("/index.html"));
    store.put(GEN, &shell, &Response::new(200, "<html>shell</html>")).unwrap();
    fetcher.go_offline();

    let served = strategy.serve(&Request::get(url("/deep/link")), GEN).await;
    assert_eq!(served.source, CacheSource::Shell);
    assert_eq!(served.response.body, Bytes::from("<html>shell</html>"));
  }

  #[tokio::test]
  async fn test_offline_without_shell_returns_notice() {
    let (_store, fetcher, strategy) = setup();
    fetcher.go_offline();

    let served = strategy.serve(&Request::get(url("/deep/link")), GEN).await;
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.header("content-type"), Some("text/plain"));
    let body = String::from_utf8(served.response.body.to_vec()).unwrap();
    assert!(body.contains("online"));
  }

  #[tokio::test]
  async fn test_write_failure_still_returns_response() {
    let (store, fetcher, strategy) = setup();
    fetcher.respond("https://app.test/late.css", Response::new(200, "body{}"));

    // The generation disappears before the write lands.
    store.delete(GEN).unwrap();
    let served = strategy.serve(&Request::get(url("/late.css")), GEN).await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, Bytes::from("body{}"));

    strategy.drain_writes().await;
    assert!(store.generation_ids().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_drains_both_finish() {
    let (store, fetcher, strategy) = setup();
    fetcher.respond("https://app.test/a.css", Response::new(200, "a"));
    fetcher.respond("https://app.test/b.css", Response::new(200, "b"));

    strategy.serve(&Request::get(url("/a.css")), GEN).await;
    strategy.serve(&Request::get(url("/b.css")), GEN).await;
    tokio::join!(strategy.drain_writes(), strategy.drain_writes());

    for path in ["/a.css", "/b.css"] {
      let key = RequestKey::new(&Method::GET, &url(path));
      assert!(store.get(GEN, &key, MatchOptions::default()).unwrap().is_some());
    }

    // Writes started after a drain are still tracked
    fetcher.respond("https://app.test/c.css", Response::new(200, "c"));
    strategy.serve(&Request::get(url("/c.css")), GEN).await;
    strategy.drain_writes().await;
    let key = RequestKey::new(&Method::GET, &url("/c.css"));
    assert!(store.get(GEN, &key, MatchOptions::default()).unwrap().is_some());
  }
}
