//! Error kinds for snapshot persistence.

use thiserror::Error;

/// Why a save did not reach the persistence slot.
///
/// The in-memory store is left untouched in every case; the next successful
/// save resynchronizes the slot.
#[derive(Debug, Error)]
pub enum PersistError {
  #[error("Failed to export snapshot: {0}")]
  Export(String),

  #[error("Failed to encode snapshot: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("Storage quota exceeded: snapshot needs {needed} bytes, quota is {quota}")]
  QuotaExceeded { needed: usize, quota: usize },

  #[error("Failed to write persistence slot: {0}")]
  Slot(#[from] std::io::Error),
}

/// Why a persisted snapshot was discarded during load.
#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("Failed to read persistence slot: {0}")]
  Slot(#[from] std::io::Error),

  #[error("Snapshot is not a JSON byte array: {0}")]
  Json(#[from] serde_json::Error),

  #[error("Snapshot could not be restored: {0}")]
  Engine(#[from] rusqlite::Error),

  #[error("Snapshot failed integrity check: {0}")]
  Integrity(String),

  #[error("Schema bootstrap failed on restored snapshot: {0}")]
  Schema(String),
}
