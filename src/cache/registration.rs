//! Page-side registration: which controller generation serves which open page.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::controller::{CacheController, WorkerState};
use super::storage::CacheStorage;
use super::traits::{FetchError, Network, Request, Served};
use super::version::VersionTag;

/// Identifier of an open page.
pub type ClientId = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
  #[error("Invalid worker URL: {0}")]
  InvalidUrl(String),

  #[error("Worker script {script} is not on origin {origin}")]
  CrossOrigin { script: String, origin: String },

  #[error("Scope {scope} is outside the worker script's directory {allowed}")]
  ScopeOutsideScript { scope: String, allowed: String },
}

/// What an update did with the freshly installed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
  /// Became the active generation; lists the caches it purged
  Activated { purged: Vec<String> },
  /// Installed, waiting for every open page to close
  Waiting,
}

/// Tracks the active and waiting controller generations and the open pages they control.
pub struct Registration<S: CacheStorage, N: Network> {
  script: Url,
  scope: Url,
  network: Arc<N>,
  skip_waiting: bool,
  active: Option<CacheController<S, N>>,
  waiting: Option<CacheController<S, N>>,
  /// Open pages and whether they are controlled
  clients: BTreeMap<ClientId, bool>,
  next_client: ClientId,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  /// Register the worker script at `script_path` for `scope_path` on `origin`.
  ///
  /// The script must be same-origin and the scope must lie within the script's directory.
  pub fn register(
    origin: &Url,
    script_path: &str,
    scope_path: &str,
    network: Arc<N>,
  ) -> Result<Self, RegistrationError> {
    let script = origin
      .join(script_path)
      .map_err(|e| RegistrationError::InvalidUrl(format!("{}: {}", script_path, e)))?;
    let scope = origin
      .join(scope_path)
      .map_err(|e| RegistrationError::InvalidUrl(format!("{}: {}", scope_path, e)))?;

    if script.origin() != origin.origin() {
      return Err(RegistrationError::CrossOrigin {
        script: script.to_string(),
        origin: origin.origin().ascii_serialization(),
      });
    }

    let allowed = match script.path().rfind('/') {
      Some(idx) => &script.path()[..=idx],
      None => "/",
    };
    if scope.origin() != origin.origin() || !scope.path().starts_with(allowed) {
      return Err(RegistrationError::ScopeOutsideScript {
        scope: scope.to_string(),
        allowed: allowed.to_string(),
      });
    }

    info!(script = %script, scope = %scope, "Worker registered");
    Ok(Self {
      script,
      scope,
      network,
      skip_waiting: true,
      active: None,
      waiting: None,
      clients: BTreeMap::new(),
      next_client: 1,
    })
  }

  /// Whether a newly installed generation replaces the active one immediately.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  pub fn script(&self) -> &Url {
    &self.script
  }

  pub fn scope(&self) -> &Url {
    &self.scope
  }

  pub fn active_version(&self) -> Option<&VersionTag> {
    self.active.as_ref().map(|c| c.version())
  }

  pub fn waiting_version(&self) -> Option<&VersionTag> {
    self.waiting.as_ref().map(|c| c.version())
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Install a new generation and, when allowed, activate it and claim every page.
  ///
  /// If install fails the previous generation keeps serving untouched.
  pub async fn update(
    &mut self,
    controller: CacheController<S, N>,
  ) -> Result<UpdateOutcome, FetchError> {
    controller.install().await?;

    let must_wait = !self.skip_waiting && self.active.is_some() && !self.clients.is_empty();
    if must_wait {
      info!(version = %controller.version(), "New cache generation waiting for pages to close");
      if let Some(previous) = self.waiting.replace(controller) {
        previous.set_state(WorkerState::Redundant);
      }
      return Ok(UpdateOutcome::Waiting);
    }

    let purged = self.promote(controller).await?;
    Ok(UpdateOutcome::Activated { purged })
  }

  /// Activate `controller`, retire the previous one, then claim every open page.
  async fn promote(&mut self, controller: CacheController<S, N>) -> Result<Vec<String>, FetchError> {
    // Purge completes before any page is claimed
    let purged = controller.activate().await?;

    if let Some(previous) = self.active.replace(controller) {
      previous.set_state(WorkerState::Redundant);
    }
    for controlled in self.clients.values_mut() {
      *controlled = true;
    }
    debug!(clients = self.clients.len(), "Claimed open pages");
    Ok(purged)
  }

  /// Reinstate the generation an earlier run left active.
  ///
  /// This is the recorded active generation when its cache still exists, so a
  /// newer build whose install has not succeeded keeps serving the older cache.
  /// Only a successful `update` replaces it.
  pub fn resume(&mut self, controller: CacheController<S, N>) -> Result<bool, FetchError> {
    let Some(version) = controller.resumable_generation()? else {
      return Ok(false);
    };
    let controller = if &version == controller.version() {
      controller
    } else {
      controller.for_generation(version)
    };
    if !controller.resume()? {
      return Ok(false);
    }

    info!(version = %controller.version(), "Resumed cache generation");
    if let Some(previous) = self.active.replace(controller) {
      previous.set_state(WorkerState::Redundant);
    }
    Ok(true)
  }

  // ==========================================================================
  // Pages
  // ==========================================================================

  /// Open a page in scope. It is controlled only if a generation is already active.
  pub fn open_client(&mut self) -> ClientId {
    let id = self.next_client;
    self.next_client += 1;
    self.clients.insert(id, self.active.is_some());
    id
  }

  /// Close a page. Closing the last one lets a waiting generation take over.
  pub async fn close_client(&mut self, id: ClientId) -> Result<Option<UpdateOutcome>, FetchError> {
    self.clients.remove(&id);
    if !self.clients.is_empty() {
      return Ok(None);
    }

    match self.waiting.take() {
      Some(controller) => {
        let purged = self.promote(controller).await?;
        Ok(Some(UpdateOutcome::Activated { purged }))
      }
      None => Ok(None),
    }
  }

  pub fn is_controlled(&self, id: ClientId) -> bool {
    self.clients.get(&id).copied().unwrap_or(false)
  }

  /// Route a page's request through its controller, or straight to the network.
  pub async fn fetch(&self, client: ClientId, request: &Request) -> Result<Served, FetchError> {
    match &self.active {
      Some(controller) if self.is_controlled(client) => controller.handle_fetch(request).await,
      _ => self.network.fetch(request).await.map(Served::from_network),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::controller::tests::{controller, url, FakeNetwork, ORIGIN};
  use crate::cache::storage::SqliteCacheStorage;
  use crate::cache::traits::ServedFrom;

  type TestRegistration = Registration<SqliteCacheStorage, FakeNetwork>;

  fn setup() -> (TestRegistration, Arc<SqliteCacheStorage>, Arc<FakeNetwork>) {
    let storage = Arc::new(SqliteCacheStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::serving(&[
      "/clases/",
      "/clases/index.html",
      "/clases/app.js",
    ]));
    let origin = Url::parse(ORIGIN).unwrap();
    let registration =
      Registration::register(&origin, "/clases/sw.js", "/clases/", Arc::clone(&network)).unwrap();
    (registration, storage, network)
  }

  #[test]
  fn test_register_rejects_cross_origin_script() {
    let origin = Url::parse(ORIGIN).unwrap();
    let network = Arc::new(FakeNetwork::default());
    let err = TestRegistration::register(&origin, "https://cdn.example/sw.js", "/", network)
      .err()
      .unwrap();
    assert!(matches!(err, RegistrationError::CrossOrigin { .. }));
  }

  #[test]
  fn test_register_rejects_scope_above_script() {
    let origin = Url::parse(ORIGIN).unwrap();
    let network = Arc::new(FakeNetwork::default());
    let err = TestRegistration::register(&origin, "/clases/js/sw.js", "/clases/", network)
      .err()
      .unwrap();
    assert!(matches!(err, RegistrationError::ScopeOutsideScript { .. }));
  }

  #[tokio::test]
  async fn test_uncontrolled_page_goes_to_network() {
    let (registration, _, network) = setup();
    let request = Request::resource(url("/clases/app.js"));

    // No active generation: works online, fails offline
    let served = registration.fetch(7, &request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    network.set_offline(true);
    assert!(registration.fetch(7, &request).await.is_err());
  }

  #[tokio::test]
  async fn test_update_claims_open_pages() {
    let (mut registration, storage, network) = setup();
    let page = registration.open_client();
    assert!(!registration.is_controlled(page));

    let outcome = registration
      .update(controller("v1", &storage, &network))
      .await
      .unwrap();
    assert_eq!(outcome, UpdateOutcome::Activated { purged: vec![] });
    assert!(registration.is_controlled(page));

    network.set_offline(true);
    let served = registration
      .fetch(page, &Request::navigate(url("/clases/deep/link")))
      .await
      .unwrap();
    assert_eq!(served.response.body, b"body of /clases/index.html");
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_generation() {
    let (mut registration, storage, network) = setup();
    registration
      .update(controller("v1", &storage, &network))
      .await
      .unwrap();
    let page = registration.open_client();

    network.fail("/clases/app.js");
    assert!(registration
      .update(controller("v2", &storage, &network))
      .await
      .is_err());

    assert_eq!(registration.active_version().map(|v| v.as_str()), Some("v1"));
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
    let served = registration
      .fetch(page, &Request::resource(url("/clases/app.js")))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Cache);
  }

  #[tokio::test]
  async fn test_redeploy_replaces_generation() {
    let (mut registration, storage, network) = setup();
    registration
      .update(controller("v1", &storage, &network))
      .await
      .unwrap();

    network.serve("/clases/app.js", 200, b"new app");
    let outcome = registration
      .update(controller("v2", &storage, &network))
      .await
      .unwrap();

    assert_eq!(
      outcome,
      UpdateOutcome::Activated {
        purged: vec!["v1".to_string()]
      }
    );
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);
    let page = registration.open_client();
    let served = registration
      .fetch(page, &Request::resource(url("/clases/app.js")))
      .await
      .unwrap();
    assert_eq!(served.response.body, b"new app");
  }

  #[tokio::test]
  async fn test_resumed_generation_controls_new_pages() {
    let (mut first, storage, network) = setup();
    first
      .update(controller("v1", &storage, &network))
      .await
      .unwrap();

    let (mut second, _, _) = setup();
    assert!(second.resume(controller("v1", &storage, &network)).unwrap());
    let page = second.open_client();
    assert!(second.is_controlled(page));

    network.set_offline(true);
    let served = second
      .fetch(page, &Request::resource(url("/clases/app.js")))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Cache);
  }

  #[tokio::test]
  async fn test_restart_with_newer_build_keeps_older_generation_offline() {
    let (mut first, storage, network) = setup();
    first
      .update(controller("v1", &storage, &network))
      .await
      .unwrap();
    drop(first);

    // A later run of a newer build whose install fails
    let (mut second, _, _) = setup();
    assert!(second.resume(controller("v2", &storage, &network)).unwrap());
    assert_eq!(second.active_version().map(|v| v.as_str()), Some("v1"));

    network.fail("/clases/app.js");
    assert!(second
      .update(controller("v2", &storage, &network))
      .await
      .is_err());
    assert_eq!(second.active_version().map(|v| v.as_str()), Some("v1"));
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);

    network.set_offline(true);
    let page = second.open_client();
    assert!(second.is_controlled(page));
    let asset = second
      .fetch(page, &Request::resource(url("/clases/index.html")))
      .await
      .unwrap();
    assert_eq!(asset.source, ServedFrom::Cache);
    let nav = second
      .fetch(page, &Request::navigate(url("/clases/")))
      .await
      .unwrap();
    assert_eq!(nav.response.body, b"body of /clases/index.html");

    // A third run still resumes v1, and a successful install replaces it
    network.set_offline(false);
    let (mut third, _, _) = setup();
    assert!(third.resume(controller("v2", &storage, &network)).unwrap());
    assert_eq!(third.active_version().map(|v| v.as_str()), Some("v1"));
    let network_ok = Arc::new(FakeNetwork::serving(&[
      "/clases/",
      "/clases/index.html",
      "/clases/app.js",
    ]));
    third
      .update(controller("v2", &storage, &network_ok))
      .await
      .unwrap();
    assert_eq!(storage.active_generation().unwrap().as_deref(), Some("v2"));
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);
  }

  #[tokio::test]
  async fn test_without_skip_waiting_new_generation_waits() {
    let (registration, storage, network) = setup();
    let mut registration = registration.with_skip_waiting(false);
    registration
      .update(controller("v1", &storage, &network))
      .await
      .unwrap();
    let page = registration.open_client();

    let outcome = registration
      .update(controller("v2", &storage, &network))
      .await
      .unwrap();
    assert_eq!(outcome, UpdateOutcome::Waiting);
    assert_eq!(registration.active_version().map(|v| v.as_str()), Some("v1"));
    assert_eq!(registration.waiting_version().map(|v| v.as_str()), Some("v2"));

    let promoted = registration.close_client(page).await.unwrap();
    assert_eq!(
      promoted,
      Some(UpdateOutcome::Activated {
        purged: vec!["v1".to_string()]
      })
    );
    assert_eq!(registration.active_version().map(|v| v.as_str()), Some("v2"));
    assert!(registration.waiting_version().is_none());
  }
}
