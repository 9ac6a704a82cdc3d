//! Offline asset cache.
//!
//! This module intercepts the app's resource requests and:
//! - Installs a versioned cache from a fixed asset manifest, all or nothing
//! - Purges every other cache generation on activation
//! - Serves navigations from the cached shell, falling back to it when offline
//! - Serves sub-resources cache-first, caching misses on demand

mod controller;
mod manifest;
mod network;
mod registration;
mod storage;
mod traits;
mod version;

pub use controller::{CacheController, WorkerState};
pub use manifest::AssetManifest;
pub use network::HttpNetwork;
pub use registration::{Registration, RegistrationError, UpdateOutcome};
pub use storage::{CacheStorage, SqliteCacheStorage};
pub use traits::{FetchError, Network, Request, Served, ServedFrom};
pub use version::VersionTag;
