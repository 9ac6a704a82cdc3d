use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{AssetManifest, VersionTag};
use crate::db::DEFAULT_KEY;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Where the store snapshot, cache database and logs live
  pub data_dir: Option<PathBuf>,
  /// Origin the app's assets are served from
  pub origin: String,
  /// Path prefix of the app under the origin
  pub base_path: String,
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub worker: WorkerConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      data_dir: None,
      origin: "http://localhost:8080".to_string(),
      base_path: "/clases".to_string(),
      storage: StorageConfig::default(),
      cache: CacheConfig::default(),
      worker: WorkerConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Slot key holding the serialized store
  pub key: String,
  /// Largest snapshot the slot accepts, in bytes
  pub quota_bytes: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      key: DEFAULT_KEY.to_string(),
      quota_bytes: 5 * 1024 * 1024,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix for generated version tags
  pub prefix: String,
  /// Explicit version tag, overriding the build's release tag
  pub version: Option<String>,
  /// Per-asset fetch timeout during install
  pub install_timeout_secs: u64,
  /// Replace the active generation without waiting for open pages to close
  pub skip_waiting: bool,
  /// Asset paths relative to `base_path`; defaults to the built-in manifest
  pub assets: Option<Vec<String>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "clases-cache".to_string(),
      version: None,
      install_timeout_secs: 30,
      skip_waiting: true,
      assets: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Worker script path (defaults to `<base_path>/sw.js`)
  pub script: Option<String>,
  /// Registration scope (defaults to `<base_path>/`)
  pub scope: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./clases.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/clases/config.yaml
  ///
  /// Defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("clases.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("clases").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.manifest().validate()?;
    Ok(config)
  }

  /// Resolved data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("clases"))
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn manifest(&self) -> AssetManifest {
    match &self.cache.assets {
      Some(assets) => AssetManifest::from_relative(&self.base_path, assets.iter().map(String::as_str)),
      None => AssetManifest::for_base(&self.base_path),
    }
  }

  pub fn version_tag(&self) -> VersionTag {
    match &self.cache.version {
      Some(version) => VersionTag::new(version.clone()),
      None => VersionTag::release(&self.cache.prefix),
    }
  }

  pub fn worker_script(&self) -> String {
    self
      .worker
      .script
      .clone()
      .unwrap_or_else(|| format!("{}/sw.js", self.base_path.trim_end_matches('/')))
  }

  pub fn worker_scope(&self) -> String {
    self
      .worker
      .scope
      .clone()
      .unwrap_or_else(|| format!("{}/", self.base_path.trim_end_matches('/')))
  }
}
