//! Cache controller: one worker generation's install, activate and fetch handling.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{debug, error, info, warn};
use url::Url;

use super::manifest::AssetManifest;
use super::storage::{CacheStorage, CachedResponse};
use super::traits::{FetchError, Network, Request, RequestMode, Response, Served};
use super::version::VersionTag;

/// Lifecycle of one controller generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Failed to install, or replaced by a newer generation
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }
}

/// Serves the app's assets from a versioned cache.
///
/// Eviction is purely generational: activation deletes every cache whose name
/// is not this controller's version tag. There is no per-entry expiry.
pub struct CacheController<S: CacheStorage, N: Network> {
  version: VersionTag,
  manifest: AssetManifest,
  origin: Url,
  storage: Arc<S>,
  network: Arc<N>,
  install_timeout: Duration,
  state: RwLock<WorkerState>,
}

impl<S: CacheStorage, N: Network> CacheController<S, N> {
  pub fn new(
    version: VersionTag,
    manifest: AssetManifest,
    origin: Url,
    storage: Arc<S>,
    network: Arc<N>,
  ) -> Self {
    Self {
      version,
      manifest,
      origin,
      storage,
      network,
      install_timeout: Duration::from_secs(30),
      state: RwLock::new(WorkerState::Parsed),
    }
  }

  /// The same build serving another generation's cache.
  pub fn for_generation(&self, version: VersionTag) -> Self {
    Self {
      version,
      manifest: self.manifest.clone(),
      origin: self.origin.clone(),
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      install_timeout: self.install_timeout,
      state: RwLock::new(WorkerState::Parsed),
    }
  }

  /// Bound each manifest fetch during install.
  pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
    self.install_timeout = timeout;
    self
  }

  pub fn version(&self) -> &VersionTag {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    *self.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn set_state(&self, state: WorkerState) {
    *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
  }

  fn expect_state(&self, expected: WorkerState) -> Result<(), FetchError> {
    let actual = self.state();
    if actual == expected {
      Ok(())
    } else {
      Err(FetchError::Lifecycle {
        expected: expected.as_str(),
        actual: actual.as_str(),
      })
    }
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Fetch every manifest asset and store them all under this version's cache.
  ///
  /// All-or-nothing: a single failed, non-2xx or timed-out fetch leaves the
  /// cache unwritten and marks this generation redundant.
  pub async fn install(&self) -> Result<(), FetchError> {
    self.expect_state(WorkerState::Parsed)?;
    self.set_state(WorkerState::Installing);
    info!(version = %self.version, assets = self.manifest.paths().len(), "Installing cache");

    match self.populate().await {
      Ok(()) => {
        self.set_state(WorkerState::Installed);
        info!(version = %self.version, "Cache installed");
        Ok(())
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        error!(version = %self.version, error = %e, "Cache install failed");
        Err(e)
      }
    }
  }

  async fn populate(&self) -> Result<(), FetchError> {
    let urls = self
      .manifest
      .urls(&self.origin)
      .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

    let entries = try_join_all(urls.into_iter().map(|url| self.fetch_for_install(url))).await?;

    self
      .storage
      .put_all(self.version.as_str(), &entries)
      .map_err(|e| FetchError::Storage(e.to_string()))
  }

  async fn fetch_for_install(&self, url: Url) -> Result<(Url, Response), FetchError> {
    let request = Request::resource(url.clone());
    let response = tokio::time::timeout(self.install_timeout, self.network.fetch(&request))
      .await
      .map_err(|_| FetchError::Timeout {
        url: url.to_string(),
        after: self.install_timeout,
      })??;

    if !response.ok() {
      return Err(FetchError::BadStatus {
        url: url.to_string(),
        status: response.status,
      });
    }
    Ok((url, response))
  }

  /// Delete every cache that is not this version's and record this version as
  /// the active generation. Returns the purged names.
  pub async fn activate(&self) -> Result<Vec<String>, FetchError> {
    self.expect_state(WorkerState::Installed)?;
    self.set_state(WorkerState::Activating);

    let activated = self.purge_other_generations().and_then(|purged| {
      self
        .storage
        .set_active_generation(self.version.as_str())
        .map_err(|e| FetchError::Storage(e.to_string()))?;
      Ok(purged)
    });

    match activated {
      Ok(purged) => {
        self.set_state(WorkerState::Activated);
        info!(version = %self.version, purged = ?purged, "Cache activated");
        Ok(purged)
      }
      Err(e) => {
        // Leave it installed so activation can be retried
        self.set_state(WorkerState::Installed);
        error!(version = %self.version, error = %e, "Cache activation failed");
        Err(e)
      }
    }
  }

  fn purge_other_generations(&self) -> Result<Vec<String>, FetchError> {
    let names = self
      .storage
      .keys()
      .map_err(|e| FetchError::Storage(e.to_string()))?;

    let mut purged = Vec::new();
    for name in names {
      if name != self.version.as_str() {
        self
          .storage
          .delete(&name)
          .map_err(|e| FetchError::Storage(e.to_string()))?;
        purged.push(name);
      }
    }
    Ok(purged)
  }

  /// Adopt a generation whose cache an earlier run already installed.
  ///
  /// Returns false, leaving the state untouched, when this version's cache does
  /// not hold the entry page.
  pub fn resume(&self) -> Result<bool, FetchError> {
    self.expect_state(WorkerState::Parsed)?;
    let entry = self.entry_url()?;
    let installed = self
      .storage
      .match_in(self.version.as_str(), &entry)
      .map_err(|e| FetchError::Storage(e.to_string()))?
      .is_some();

    if installed {
      self.set_state(WorkerState::Activated);
    }
    Ok(installed)
  }

  /// The generation a new process should serve from.
  ///
  /// The recorded active generation wins while its cache exists. Without one,
  /// this version's cache is used, then the newest cache on disk.
  pub fn resumable_generation(&self) -> Result<Option<VersionTag>, FetchError> {
    let names = self
      .storage
      .keys()
      .map_err(|e| FetchError::Storage(e.to_string()))?;
    let recorded = self
      .storage
      .active_generation()
      .map_err(|e| FetchError::Storage(e.to_string()))?;

    let chosen = recorded
      .filter(|name| names.contains(name))
      .or_else(|| {
        names
          .iter()
          .find(|name| name.as_str() == self.version.as_str())
          .cloned()
      })
      .or_else(|| names.last().cloned());
    Ok(chosen.map(VersionTag::new))
  }

  fn entry_url(&self) -> Result<Url, FetchError> {
    self
      .origin
      .join(&self.manifest.entry_page())
      .map_err(|e| FetchError::InvalidUrl(e.to_string()))
  }

  // ==========================================================================
  // Fetch interception
  // ==========================================================================

  /// Answer one intercepted request.
  pub async fn handle_fetch(&self, request: &Request) -> Result<Served, FetchError> {
    match request.mode {
      RequestMode::Navigate => self.handle_navigation(request).await,
      RequestMode::SubResource => self.handle_resource(request).await,
    }
  }

  /// Navigations land on the cached shell whatever path was asked for.
  async fn handle_navigation(&self, request: &Request) -> Result<Served, FetchError> {
    let entry = self.entry_url()?;

    if let Some(cached) = self.lookup(&entry) {
      debug!(url = %request.url, cache = %cached.cache_name, "Navigation served from cached shell");
      return Ok(Served::from_cache(cached.response));
    }

    match self.network.fetch(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(e) => match self.lookup(&entry) {
        Some(cached) => {
          debug!(url = %request.url, cache = %cached.cache_name, "Network unavailable, falling back to cached shell");
          Ok(Served::fallback(cached.response))
        }
        None => Err(e),
      },
    }
  }

  /// Cache-first with on-demand population. No revalidation of hits.
  async fn handle_resource(&self, request: &Request) -> Result<Served, FetchError> {
    if let Some(cached) = self.lookup(&request.url) {
      debug!(
        url = %request.url,
        cache = %cached.cache_name,
        cached_at = %cached.cached_at,
        "Cache hit"
      );
      return Ok(Served::from_cache(cached.response));
    }

    debug!(url = %request.url, "Cache miss");
    let response = self.network.fetch(request).await?;

    if response.is_cacheable() {
      let copy = response.clone();
      if let Err(e) = self.storage.put(self.version.as_str(), &request.url, &copy) {
        warn!(url = %request.url, error = %e, "Failed to cache response");
      }
    }
    Ok(Served::from_network(response))
  }

  /// A storage failure on lookup is treated as a miss.
  fn lookup(&self, url: &Url) -> Option<CachedResponse> {
    match self.storage.match_url(url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %url, error = %e, "Cache lookup failed");
        None
      }
    }
  }
}
