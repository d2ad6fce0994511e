//! Install-time population of a generation from the asset manifest.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheStore, Generation};
use crate::error::PrecacheError;
use crate::network::Fetcher;
use crate::request::{Request, RequestKey, Response};

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
  pub generation: String,
  /// Number of manifest entries stored
  pub stored: usize,
  /// The new generation should take over without waiting for old clients to close
  pub skip_waiting: bool,
}

pub struct Precache<S: CacheStore, N: Fetcher> {
  store: Arc<S>,
  fetcher: Arc<N>,
}

impl<S: CacheStore, N: Fetcher> Precache<S, N> {
  pub fn new(store: Arc<S>, fetcher: Arc<N>) -> Self {
    Self { store, fetcher }
  }

  /// Fetch every manifest URL and store them all in `generation`.
  ///
  /// Nothing is written unless every URL answered with a 2xx status.
  pub async fn precache(
    &self,
    generation: &str,
    manifest: &[Url],
  ) -> Result<InstallOutcome, PrecacheError> {
    info!(generation, assets = manifest.len(), "precaching manifest");

    let entries = try_join_all(manifest.iter().map(|url| self.fetch_asset(url))).await?;

    let stored = entries.len();
    Generation::existing(Arc::clone(&self.store), generation)
      .put_all(entries)
      .await?;

    info!(generation, stored, "precache complete");
    Ok(InstallOutcome {
      generation: generation.to_string(),
      stored,
      skip_waiting: true,
    })
  }

  async fn fetch_asset(&self, url: &Url) -> Result<(RequestKey, Response), PrecacheError> {
    let request = Request::get(url.clone());
    let response = self
      .fetcher
      .fetch(&request)
      .await
      .map_err(|source| PrecacheError::Fetch {
        url: url.to_string(),
        source,
      })?;

    if !response.is_success() {
      return Err(PrecacheError::Status {
        url: url.to_string(),
        status: response.status,
      });
    }

    debug!(
      %url,
      bytes = response.body.len(),
      content_type = response.header("content-type").unwrap_or("-"),
      "fetched asset"
    );
    Ok((request.key(), response))
  }
}
