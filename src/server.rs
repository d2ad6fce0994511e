//! Local reverse proxy: every incoming request becomes a fetch event.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request as HttpRequest, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::clients::ClientId;
use crate::engine::{Engine, FetchOutcome};
use crate::network::Fetcher;
use crate::request::{Request, Response};

/// Header reporting where a response came from.
pub const SOURCE_HEADER: &str = "x-shellcache-source";

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Shared handler state. The proxy is one client of the engine; every request
/// it forwards is tagged with that client.
pub struct ProxyState<S: CacheStore, N: Fetcher> {
  engine: Arc<Engine<S, N>>,
  client: ClientId,
}

impl<S: CacheStore, N: Fetcher> Clone for ProxyState<S, N> {
  fn clone(&self) -> Self {
    Self {
      engine: Arc::clone(&self.engine),
      client: self.client,
    }
  }
}

impl<S: CacheStore, N: Fetcher> ProxyState<S, N> {
  pub fn new(engine: Arc<Engine<S, N>>, client: ClientId) -> Self {
    Self { engine, client }
  }
}

pub fn router<S: CacheStore, N: Fetcher>(state: ProxyState<S, N>) -> Router {
  Router::new()
    .fallback(proxy::<S, N>)
    .with_state(state)
}

/// Serve until the process is interrupted, then let pending cache writes finish.
pub async fn serve<S: CacheStore, N: Fetcher>(engine: Arc<Engine<S, N>>, listener: TcpListener) -> Result<()> {
  let addr = listener.local_addr()?;
  let client = engine.register_client();
  info!(%addr, scope = %engine.deployment().scope, "proxy listening");

  let result = axum::serve(listener, router(ProxyState::new(Arc::clone(&engine), client)))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await;

  engine.unregister_client(client);
  engine.drain_writes().await;
  result.map_err(|e| eyre!("Proxy server failed: {}", e))
}

async fn proxy<S: CacheStore, N: Fetcher>(
  State(state): State<ProxyState<S, N>>,
  incoming: HttpRequest,
) -> HttpResponse {
  let engine = state.engine;
  let request = match into_engine_request(engine.deployment().scope.clone(), incoming).await {
    Ok(request) => request.with_client(state.client),
    Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
  };

  match engine.handle_fetch(&request).await {
    FetchOutcome::Respond(served) => into_http_response(served.response, served.source.as_str()),
    FetchOutcome::Fallthrough => match engine.passthrough(&request).await {
      Ok(response) => into_http_response(response, "passthrough"),
      Err(e) => {
        warn!(url = %request.url, error = %e, "upstream unreachable");
        (StatusCode::BAD_GATEWAY, format!("Upstream unreachable: {}", e)).into_response()
      }
    },
  }
}

async fn into_engine_request(
  scope: url::Url,
  incoming: HttpRequest,
) -> std::result::Result<Request, String> {
  let (parts, body) = incoming.into_parts();

  let target = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = scope
    .join(target)
    .map_err(|e| format!("Invalid request target {}: {}", target, e))?;
  if url.origin() != scope.origin() {
    return Err(format!("Request target {} leaves the application origin", target));
  }

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let body = to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| format!("Failed to read request body: {}", e))?;

  Ok(Request {
    method: parts.method,
    url,
    headers,
    body,
    client: None,
  })
}

fn into_http_response(response: Response, source: &'static str) -> HttpResponse {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut out = HttpResponse::new(Body::from(response.body));
  *out.status_mut() = status;

  let headers = out.headers_mut();
  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(source));
  out
}
