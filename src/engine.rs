//! The caching engine: lifecycle events in, responses out.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::cache::{run_blocking, CacheFirst, CacheStore, Served};
use crate::clients::{ClientId, ClientRegistry};
use crate::config::Deployment;
use crate::error::{EngineError, NetworkError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::network::Fetcher;
use crate::precache::{InstallOutcome, Precache};
use crate::request::{Request, RequestKey, Response};
use crate::router::{Route, Router};
use crate::sweeper::Sweeper;

/// Answer to a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
  /// The engine produced the response
  Respond(Served),
  /// Not ours; the host performs its default network handling
  Fallthrough,
}

/// Result of a completed activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
  pub generation: String,
  /// Generations removed by the sweep
  pub deleted: Vec<String>,
  /// Clients now controlled by the new generation
  pub claimed: usize,
}

pub struct Engine<S: CacheStore, N: Fetcher> {
  deployment: Deployment,
  store: Arc<S>,
  fetcher: Arc<N>,
  router: Router,
  strategy: CacheFirst<S, N>,
  lifecycle: Mutex<Lifecycle>,
  clients: ClientRegistry,
}

impl<S: CacheStore, N: Fetcher> Engine<S, N> {
  pub fn new(deployment: Deployment, store: Arc<S>, fetcher: Arc<N>) -> Self {
    let shell = RequestKey::new(&reqwest::Method::GET, &deployment.shell);
    let strategy = CacheFirst::new(Arc::clone(&store), Arc::clone(&fetcher), shell)
      .with_store_error_responses(deployment.store_error_responses);

    Self {
      router: Router::new(&deployment.scope),
      deployment,
      store,
      fetcher,
      strategy,
      lifecycle: Mutex::new(Lifecycle::new()),
      clients: ClientRegistry::new(),
    }
  }

  pub fn deployment(&self) -> &Deployment {
    &self.deployment
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  #[cfg(test)]
  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  /// Register a newly opened client. The serving generation, if any, controls it
  /// from the start.
  pub fn register_client(&self) -> ClientId {
    let id = self.clients.register(self.serving_generation());
    debug!(?id, "client registered");
    id
  }

  pub fn unregister_client(&self, id: ClientId) {
    self.clients.unregister(id);
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle().state()
  }

  /// Generation currently answering fetch events.
  pub fn serving_generation(&self) -> Option<String> {
    self.lifecycle().serving().map(String::from)
  }

  pub async fn generation_ids(&self) -> Result<BTreeSet<String>, EngineError> {
    Ok(run_blocking(&self.store, |store| store.generation_ids()).await?)
  }

  /// Install event: precache the manifest into this deployment's generation.
  pub async fn install(&self) -> Result<InstallOutcome, EngineError> {
    let generation = self.deployment.generation.clone();
    self.lifecycle().begin_install(&generation)?;
    info!(%generation, "installing");

    let result = Precache::new(Arc::clone(&self.store), Arc::clone(&self.fetcher))
      .precache(&generation, &self.deployment.manifest)
      .await;

    self.lifecycle().finish_install(result.is_ok())?;
    match result {
      Ok(outcome) => {
        info!(%generation, stored = outcome.stored, "installed");
        Ok(outcome)
      }
      Err(e) => {
        error!(%generation, error = %e, "install failed");
        Err(e.into())
      }
    }
  }

  /// Activate event: sweep stale generations, then claim open clients.
  pub async fn activate(&self) -> Result<ActivateOutcome, EngineError> {
    let generation = self.lifecycle().begin_activate()?;
    info!(%generation, "activating");

    let deleted = match Sweeper::new(Arc::clone(&self.store)).sweep(&generation).await {
      Ok(deleted) => deleted,
      Err(e) => {
        error!(%generation, error = %e, "sweep failed, not claiming clients");
        self.lifecycle().finish_activate(false)?;
        return Err(EngineError::Sweep(e));
      }
    };

    // Serving switches before the claim so claimed clients see the new generation.
    self.lifecycle().finish_activate(true)?;
    let claimed = self.clients.claim_all(&generation);
    info!(%generation, claimed, "active");

    Ok(ActivateOutcome {
      generation,
      deleted,
      claimed,
    })
  }

  /// Install, then activate immediately when the install asks to skip waiting.
  ///
  /// If the install fails, an already-installed generation in the store keeps
  /// serving: this deployment's own generation if present, otherwise the only
  /// generation left by the previous activation.
  pub async fn start(&self) -> Result<Option<ActivateOutcome>, EngineError> {
    match self.install().await {
      Ok(outcome) if outcome.skip_waiting => self.activate().await.map(Some),
      Ok(_) => Ok(None),
      Err(install_error) => {
        let ids = self.generation_ids().await?;
        let fallback = if ids.contains(&self.deployment.generation) {
          Some(self.deployment.generation.clone())
        } else if ids.len() == 1 {
          ids.into_iter().next()
        } else {
          None
        };

        match fallback {
          Some(generation) => {
            warn!(%generation, error = %install_error, "install failed, serving installed generation");
            self.lifecycle().resume(&generation)?;
            let claimed = self.clients.claim_all(&generation);
            info!(%generation, claimed, "active");
            Ok(None)
          }
          None => Err(install_error),
        }
      }
    }
  }

  /// Fetch event.
  pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
    // Classification happens before any await.
    if let Route::Passthrough(reason) = self.router.route(request) {
      debug!(method = %request.method, url = %request.url, ?reason, "passthrough");
      return FetchOutcome::Fallthrough;
    }

    let Some(generation) = self.controlling_generation(request) else {
      debug!(url = %request.url, "not controlled, passthrough");
      return FetchOutcome::Fallthrough;
    };

    FetchOutcome::Respond(self.strategy.serve(request, &generation).await)
  }

  /// Default network handling for requests the engine does not own.
  pub async fn passthrough(&self, request: &Request) -> Result<Response, NetworkError> {
    self.fetcher.fetch(request).await
  }

  /// Wait for background cache writes to finish.
  pub async fn drain_writes(&self) {
    self.strategy.drain_writes().await;
  }

  fn controlling_generation(&self, request: &Request) -> Option<String> {
    let serving = self.serving_generation()?;
    match request.client {
      // Known clients are only served once claimed.
      Some(id) => self.clients.controller(id).filter(|g| *g == serving),
      None => Some(serving),
    }
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    // Transitions never panic midway, so a poisoned lock is still consistent.
    self
      .lifecycle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
