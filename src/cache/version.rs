//! Cache generation identifiers.
//!
//! A version tag names one generation of the asset cache. Activation deletes
//! every cache with a different tag, so a new tag is the only way to invalidate
//! previously cached assets.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Hex digits of the content hash kept in a tag.
const HASH_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionTag(String);

impl VersionTag {
  pub fn new(tag: impl Into<String>) -> Self {
    Self(tag.into())
  }

  /// Tag for this build: `<prefix>-v<version>`.
  ///
  /// The version is `CLASES_CACHE_VERSION` when set at compile time, otherwise
  /// the crate version.
  pub fn release(prefix: &str) -> Self {
    let version = option_env!("CLASES_CACHE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    Self(format!("{}-v{}", prefix, version))
  }

  /// Tag derived from asset contents: `<prefix>-<sha256 prefix>`.
  ///
  /// Files are hashed in path order, so the tag changes whenever any asset's
  /// path or bytes change.
  pub fn from_content<'a, I>(prefix: &str, files: I) -> Self
  where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
  {
    let mut files: Vec<(&str, &[u8])> = files.into_iter().collect();
    files.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (path, bytes) in files {
      hasher.update(path.as_bytes());
      hasher.update([0u8]);
      hasher.update((bytes.len() as u64).to_le_bytes());
      hasher.update(bytes);
    }
    let digest = hex::encode(hasher.finalize());

    Self(format!("{}-{}", prefix, &digest[..HASH_LEN]))
  }

  /// Content tag over every file below `dir`.
  pub fn from_dir(prefix: &str, dir: &Path) -> Result<Self> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    Ok(Self::from_content(
      prefix,
      files.iter().map(|(path, bytes)| (path.as_str(), bytes.as_slice())),
    ))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for VersionTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
  let entries =
    std::fs::read_dir(dir).map_err(|e| eyre!("Failed to read {}: {}", dir.display(), e))?;

  for entry in entries {
    let path = entry
      .map_err(|e| eyre!("Failed to read entry in {}: {}", dir.display(), e))?
      .path();
    if path.is_dir() {
      collect_files(root, &path, out)?;
      continue;
    }

    let relative = path
      .strip_prefix(root)
      .map_err(|e| eyre!("Failed to relativize {}: {}", path.display(), e))?
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");
    let bytes =
      std::fs::read(&path).map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
    out.push((relative, bytes));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_release_tag() {
    let tag = VersionTag::release("clases-cache");
    assert!(tag.as_str().starts_with("clases-cache-v"));
  }

  #[test]
  fn test_content_tag_ignores_order() {
    let a = VersionTag::from_content("c", [("app.js", &b"1"[..]), ("style.css", &b"2"[..])]);
    let b = VersionTag::from_content("c", [("style.css", &b"2"[..]), ("app.js", &b"1"[..])]);
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), "c-".len() + HASH_LEN);
  }

  #[test]
  fn test_content_tag_changes_with_bytes() {
    let a = VersionTag::from_content("c", [("app.js", &b"1"[..])]);
    let b = VersionTag::from_content("c", [("app.js", &b"2"[..])]);
    assert_ne!(a, b);
  }

  #[test]
  fn test_from_dir_matches_from_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("icons")).unwrap();
    std::fs::write(dir.path().join("app.js"), b"js").unwrap();
    std::fs::write(dir.path().join("icons").join("icon-192.png"), b"png").unwrap();

    let expected = VersionTag::from_content(
      "c",
      [("app.js", &b"js"[..]), ("icons/icon-192.png", &b"png"[..])],
    );
    assert_eq!(VersionTag::from_dir("c", dir.path()).unwrap(), expected);
  }
}
