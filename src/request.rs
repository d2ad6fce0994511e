//! Request and response snapshots flowing through the engine.

use bytes::Bytes;
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::clients::ClientId;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  /// The client context that issued the request, if the host knows it
  pub client: Option<ClientId>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Bytes::new(),
      client: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_client(mut self, client: ClientId) -> Self {
    self.client = Some(client);
    self
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// A response snapshot. Cloning is cheap: the body is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Look up a header, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_error(&self) -> bool {
    self.status >= 400
  }
}

/// Normalized request identity used to address cache entries.
///
/// The identity is the upper-cased method plus the URL with its fragment
/// removed. A second, query-less identity supports `ignore_query` matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
  url_without_query: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    let full = url.to_string();
    url.set_query(None);

    Self {
      method: method.as_str().to_ascii_uppercase(),
      url: full,
      url_without_query: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn url_without_query(&self) -> &str {
    &self.url_without_query
  }

  /// Whether two identities address the same resource, optionally ignoring the query.
  pub fn matches(&self, other: &RequestKey, ignore_query: bool) -> bool {
    if self.method != other.method {
      return false;
    }
    if ignore_query {
      self.url_without_query == other.url_without_query
    } else {
      self.url == other.url
    }
  }

  /// Stable hash of the exact identity.
  pub fn hash(&self) -> String {
    digest(&format!("{} {}", self.method, self.url))
  }

  /// Stable hash of the identity with the query string dropped.
  pub fn match_hash(&self) -> String {
    digest(&format!("{} {}", self.method, self.url_without_query))
  }
}

fn digest(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(url: &str) -> RequestKey {
    RequestKey::new(&Method::GET, &Url::parse(url).unwrap())
  }

  #[test]
  fn test_query_is_kept_in_exact_identity() {
    let plain = key("https://app.test/index.html");
    let busted = key("https://app.test/index.html?x=1");
    assert_ne!(plain.hash(), busted.hash());
    assert_eq!(plain.match_hash(), busted.match_hash());
  }

  #[test]
  fn test_fragment_is_ignored() {
    let a = key("https://app.test/page#top");
    let b = key("https://app.test/page");
    assert_eq!(a, b);
    assert_eq!(a.url(), "https://app.test/page");
  }

  #[test]
  fn test_method_is_part_of_identity() {
    let url = Url::parse("https://app.test/a").unwrap();
    let get = RequestKey::new(&Method::GET, &url);
    let head = RequestKey::new(&Method::HEAD, &url);
    assert_ne!(get.hash(), head.hash());
    assert_eq!(head.method(), "HEAD");
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "hi").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert!(response.is_success());
    assert!(!response.is_error());
  }
}
