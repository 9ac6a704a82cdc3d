//! Core traits and types for the offline cache.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// What kind of load a request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Loading an HTML document
  Navigate,
  /// Scripts, styles, binaries, icons
  SubResource,
}

/// An intercepted resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn navigate(url: Url) -> Self {
    Self {
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn resource(url: Url) -> Self {
    Self {
      url,
      mode: RequestMode::SubResource,
    }
  }
}

/// Visibility class of a response, as seen by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  /// Same-origin
  Basic,
  /// Cross-origin with CORS approval
  Cors,
  /// Cross-origin without CORS approval
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      _ => None,
    }
  }
}

/// A fetched or cached response. Cloning yields an independent copy of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  /// Final URL after redirects
  pub url: Url,
  pub status: u16,
  pub kind: ResponseKind,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  /// Status in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  /// Whether a network response may be stored for later cache hits.
  pub fn is_cacheable(&self) -> bool {
    self.ok() && matches!(self.kind, ResponseKind::Basic | ResponseKind::Cors)
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Direct cache hit
  Cache,
  /// Cache miss, fetched from network
  Network,
  /// Network failed, served the cached entry page instead
  Fallback,
}

/// A response handed back to the requester.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ServedFrom,
}

impl Served {
  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Cache,
    }
  }

  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
    }
  }

  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Fallback,
    }
  }
}

/// Failures surfaced by the cache controller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network request for {url} failed: {reason}")]
  Network { url: String, reason: String },

  #[error("Request for {url} timed out after {after:?}")]
  Timeout { url: String, after: Duration },

  #[error("Request for {url} returned status {status}")]
  BadStatus { url: String, status: u16 },

  #[error("Cache storage error: {0}")]
  Storage(String),

  #[error("Invalid asset URL: {0}")]
  InvalidUrl(String),

  #[error("Worker is {actual}, expected {expected}")]
  Lifecycle {
    expected: &'static str,
    actual: &'static str,
  },
}

/// Network access used on cache misses and during install.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}
