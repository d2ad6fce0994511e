//! Request classification: which intercepted requests the engine owns.

use reqwest::Method;
use url::{Origin, Url};

use crate::request::Request;

/// Routing decision for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Served by the cache-first strategy
  Owned,
  /// Left to default network handling, untouched
  Passthrough(PassReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
  NotGet,
  CrossOrigin,
}

impl Route {
  pub fn is_owned(&self) -> bool {
    matches!(self, Route::Owned)
  }
}

/// Classifies requests against the application's origin.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Origin,
}

impl Router {
  pub fn new(scope: &Url) -> Self {
    Self {
      origin: scope.origin(),
    }
  }

  /// Decide ownership. Purely synchronous.
  pub fn route(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Passthrough(PassReason::NotGet);
    }
    if request.url.origin() != self.origin {
      return Route::Passthrough(PassReason::CrossOrigin);
    }
    Route::Owned
  }
}
