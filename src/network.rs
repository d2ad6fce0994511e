//! Network access for the engine.

use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

use crate::error::NetworkError;
use crate::request::{Request, Response};

/// Something that can take a request to the network.
///
/// Any response, whatever its status, is a success. Only transport failures
/// (offline, DNS, timeout) are errors.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}

/// Fetcher backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Option<Duration>) -> Result<Self, NetworkError> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    Ok(Self {
      client: builder.build()?,
    })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut outgoing = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      outgoing = outgoing.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
      outgoing = outgoing.body(request.body.clone());
    }

    let reply = outgoing.send().await.map_err(|e| {
      if e.is_connect() {
        NetworkError::Unreachable(format!("{}: {}", request.url, e))
      } else {
        NetworkError::Transport(e)
      }
    })?;
    let status = reply.status().as_u16();
    let headers = reply
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body: Bytes = reply.bytes().await?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
