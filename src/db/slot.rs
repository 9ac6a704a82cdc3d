//! Key-value persistence slots that hold serialized snapshots.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::error::PersistError;

/// A key-value durable storage primitive.
///
/// Values are overwritten, never appended. Reading an absent key is not an error.
pub trait PersistenceSlot {
  /// Read the value stored under `key`, if any.
  fn get(&self, key: &str) -> std::io::Result<Option<String>>;

  /// Replace the value stored under `key`.
  fn set(&self, key: &str, value: &str) -> Result<(), PersistError>;
}

/// File-backed slot: one file per key inside a directory.
pub struct FileSlot {
  dir: PathBuf,
  quota: Option<usize>,
}

impl FileSlot {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      quota: None,
    }
  }

  /// Reject writes larger than `quota` bytes.
  pub fn with_quota(mut self, quota: usize) -> Self {
    self.quota = Some(quota);
    self
  }

  fn path_for(&self, key: &str) -> PathBuf {
    let name: String = key
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
      .collect();
    self.dir.join(format!("{}.json", name))
  }
}

impl PersistenceSlot for FileSlot {
  fn get(&self, key: &str) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(self.path_for(key)) {
      Ok(contents) => Ok(Some(contents)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
    check_quota(self.quota, value)?;

    std::fs::create_dir_all(&self.dir)?;

    // Write to a sibling temp file and rename so a crash never leaves half a snapshot
    let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
    tmp.write_all(value.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(self.path_for(key)).map_err(|e| e.error)?;

    Ok(())
  }
}

/// In-memory slot, used by tests and by callers that opt out of durability.
#[derive(Default)]
pub struct MemorySlot {
  values: Mutex<HashMap<String, String>>,
  quota: Option<usize>,
  failing: AtomicBool,
}

impl MemorySlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(mut self, quota: usize) -> Self {
    self.quota = Some(quota);
    self
  }

  /// Make every subsequent write fail with an I/O error.
  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }
}

impl PersistenceSlot for MemorySlot {
  fn get(&self, key: &str) -> std::io::Result<Option<String>> {
    let values = self
      .values
      .lock()
      .map_err(|e| std::io::Error::other(format!("Lock poisoned: {}", e)))?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(PersistError::Slot(std::io::Error::other(
        "persistence slot unavailable",
      )));
    }
    check_quota(self.quota, value)?;

    let mut values = self
      .values
      .lock()
      .map_err(|e| std::io::Error::other(format!("Lock poisoned: {}", e)))?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }
}

fn check_quota(quota: Option<usize>, value: &str) -> Result<(), PersistError> {
  match quota {
    Some(quota) if value.len() > quota => Err(PersistError::QuotaExceeded {
      needed: value.len(),
      quota,
    }),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_slot_absent_key_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let slot = FileSlot::new(dir.path());
    assert!(slot.get("db").unwrap().is_none());
  }

  #[test]
  fn test_file_slot_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let slot = FileSlot::new(dir.path().join("storage"));
    slot.set("db", "[1,2,3]").unwrap();
    slot.set("db", "[4]").unwrap();
    assert_eq!(slot.get("db").unwrap().as_deref(), Some("[4]"));
  }

  #[test]
  fn test_file_slot_quota() {
    let dir = tempfile::tempdir().unwrap();
    let slot = FileSlot::new(dir.path()).with_quota(4);
    slot.set("db", "[1]").unwrap();

    let err = slot.set("db", "[1,2,3]").unwrap_err();
    assert!(matches!(
      err,
      PersistError::QuotaExceeded {
        needed: 7,
        quota: 4
      }
    ));
    // Rejected write leaves the previous value in place
    assert_eq!(slot.get("db").unwrap().as_deref(), Some("[1]"));
  }

  #[test]
  fn test_memory_slot_failing() {
    let slot = MemorySlot::new();
    slot.set("db", "[]").unwrap();
    slot.set_failing(true);
    assert!(matches!(slot.set("db", "[1]"), Err(PersistError::Slot(_))));
    assert_eq!(slot.get("db").unwrap().as_deref(), Some("[]"));
  }
}
