//! The fixed list of assets the app needs to run offline.

use color_eyre::{eyre::eyre, Result};
use url::Url;

/// Default assets, relative to the app's base path. The empty entry is the shell itself.
pub const DEFAULT_ASSETS: &[&str] = &[
  "",
  "index.html",
  "style.css",
  "app.js",
  "manifest.json",
  "sql-wasm.js",
  "sql-wasm.wasm",
  "icon-192.png",
  "icon-512.png",
];

const ENTRY_PAGE: &str = "index.html";

/// Assets without which an offline load cannot bring the store back.
const ESSENTIAL: &[&str] = &[ENTRY_PAGE, "sql-wasm.js", "sql-wasm.wasm"];

/// Ordered list of resource paths that must be cached before install succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
  base: String,
  paths: Vec<String>,
}

impl AssetManifest {
  /// The default manifest under `base` (e.g. "/clases").
  pub fn for_base(base: &str) -> Self {
    Self::from_relative(base, DEFAULT_ASSETS.iter().copied())
  }

  /// A manifest from asset paths relative to `base`.
  pub fn from_relative<'a, I>(base: &str, assets: I) -> Self
  where
    I: IntoIterator<Item = &'a str>,
  {
    let base = normalize_base(base);
    let paths = assets
      .into_iter()
      .map(|asset| format!("{}/{}", base, asset.trim_start_matches('/')))
      .collect();
    Self { base, paths }
  }

  /// Absolute paths in manifest order.
  pub fn paths(&self) -> &[String] {
    &self.paths
  }

  /// Path of the cached shell served to navigations.
  pub fn entry_page(&self) -> String {
    format!("{}/{}", self.base, ENTRY_PAGE)
  }

  /// Resolve every path against `origin`.
  pub fn urls(&self, origin: &Url) -> Result<Vec<Url>, url::ParseError> {
    self.paths.iter().map(|p| origin.join(p)).collect()
  }

  /// Reject manifests missing an asset needed to bootstrap offline.
  pub fn validate(&self) -> Result<()> {
    let missing: Vec<String> = ESSENTIAL
      .iter()
      .map(|asset| format!("{}/{}", self.base, asset))
      .filter(|path| !self.paths.contains(path))
      .collect();

    if missing.is_empty() {
      Ok(())
    } else {
      Err(eyre!(
        "Asset manifest is missing offline essentials: {}",
        missing.join(", ")
      ))
    }
  }
}

/// "/clases/" -> "/clases", "/" -> "", "clases" -> "/clases"
fn normalize_base(base: &str) -> String {
  let trimmed = base.trim_matches('/');
  if trimmed.is_empty() {
    String::new()
  } else {
    format!("/{}", trimmed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_manifest() {
    let manifest = AssetManifest::for_base("/clases");
    assert_eq!(manifest.paths()[0], "/clases/");
    assert_eq!(manifest.paths()[1], "/clases/index.html");
    assert!(manifest.paths().contains(&"/clases/sql-wasm.wasm".to_string()));
    assert_eq!(manifest.entry_page(), "/clases/index.html");
    assert!(manifest.validate().is_ok());
  }

  #[test]
  fn test_root_base() {
    let manifest = AssetManifest::for_base("/");
    assert_eq!(manifest.paths()[0], "/");
    assert_eq!(manifest.entry_page(), "/index.html");
  }

  #[test]
  fn test_missing_engine_binary_is_rejected() {
    let manifest = AssetManifest::from_relative("/clases", ["", "index.html", "app.js", "sql-wasm.js"]);
    let err = manifest.validate().unwrap_err().to_string();
    assert!(err.contains("/clases/sql-wasm.wasm"));
  }

  #[test]
  fn test_urls_resolve_against_origin() {
    let origin = Url::parse("https://example.org").unwrap();
    let urls = AssetManifest::for_base("clases/").urls(&origin).unwrap();
    assert_eq!(urls[1].as_str(), "https://example.org/clases/index.html");
  }
}
