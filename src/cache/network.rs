//! HTTP network access for cache misses and install.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use url::Url;

use super::traits::{FetchError, Network, Request, Response, ResponseKind};

/// `reqwest`-backed network. Responses are classified relative to the app's origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("clases/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let network_error = |e: reqwest::Error| FetchError::Network {
      url: request.url.to_string(),
      reason: e.to_string(),
    };

    let response = self
      .client
      .get(request.url.clone())
      .send()
      .await
      .map_err(network_error)?;

    let url = response.url().clone();
    let status = response.status().as_u16();
    let kind = classify(
      &self.origin,
      &url,
      response.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN),
    );
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await.map_err(network_error)?.to_vec();

    Ok(Response {
      url,
      status,
      kind,
      content_type,
      body,
    })
  }
}

/// Same-origin responses are basic; cross-origin ones need a CORS grant to be readable.
fn classify(origin: &Url, url: &Url, cors_granted: bool) -> ResponseKind {
  if url.origin() == origin.origin() {
    ResponseKind::Basic
  } else if cors_granted {
    ResponseKind::Cors
  } else {
    ResponseKind::Opaque
  }
}
