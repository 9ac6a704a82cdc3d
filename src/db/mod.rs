//! Local durable store.
//!
//! The store lives entirely in memory and is made durable by writing a full
//! snapshot to a key-value slot after every mutation. Concurrent writers sharing
//! one slot race with last-write-wins semantics; there is no merge.

mod error;
pub mod schema;
mod slot;
pub mod snapshot;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

pub use error::{PersistError, SnapshotError};
pub use slot::{FileSlot, MemorySlot, PersistenceSlot};

/// Default slot key holding the serialized store.
pub const DEFAULT_KEY: &str = "db";

/// The live, mutable database instance.
pub struct StoreHandle {
  conn: Connection,
}

impl StoreHandle {
  /// Create a brand-new empty store.
  pub fn empty() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Ok(Self { conn })
  }

  /// Get a reference to the connection
  pub fn conn(&self) -> &Connection {
    &self.conn
  }
}

/// How the store handed out by [`load`] came to be.
#[derive(Debug)]
pub enum LoadOrigin {
  /// Nothing was persisted; started empty.
  Fresh,
  /// Rehydrated from the persisted snapshot.
  Restored,
  /// The persisted snapshot was unusable and was discarded.
  Recovered(SnapshotError),
}

/// Result of loading the store at startup.
pub struct LoadOutcome {
  pub handle: StoreHandle,
  pub origin: LoadOrigin,
}

/// Load the store persisted under `key`, falling back to an empty store.
///
/// A corrupt snapshot never fails startup: it is logged and replaced. The schema
/// is bootstrapped on whichever store is returned. The only error is the engine
/// itself being unable to open an in-memory database.
pub fn load(slot: &dyn PersistenceSlot, key: &str) -> Result<LoadOutcome> {
  let origin = match restore(slot, key) {
    Ok(Some(handle)) => match ensure_schema(&handle) {
      Ok(()) => {
        info!(key, "Restored store from snapshot");
        return Ok(LoadOutcome {
          handle,
          origin: LoadOrigin::Restored,
        });
      }
      Err(e) => LoadOrigin::Recovered(SnapshotError::Schema(e.to_string())),
    },
    Ok(None) => {
      debug!(key, "No snapshot persisted, starting empty");
      LoadOrigin::Fresh
    }
    Err(e) => LoadOrigin::Recovered(e),
  };

  if let LoadOrigin::Recovered(reason) = &origin {
    warn!(key, error = %reason, "Could not load saved store, creating a new one");
  }

  let handle = StoreHandle::empty()?;
  ensure_schema(&handle)?;
  Ok(LoadOutcome { handle, origin })
}

fn restore(slot: &dyn PersistenceSlot, key: &str) -> Result<Option<StoreHandle>, SnapshotError> {
  let Some(saved) = slot.get(key)? else {
    return Ok(None);
  };
  let bytes = snapshot::decode(&saved)?;
  let conn = snapshot::import(&bytes)?;
  Ok(Some(StoreHandle { conn }))
}

/// Serialize the store and overwrite the slot under `key`.
///
/// Failure is logged and returned; the in-memory store is never rolled back.
pub fn save(handle: &StoreHandle, slot: &dyn PersistenceSlot, key: &str) -> Result<(), PersistError> {
  let result = snapshot::export(&handle.conn)
    .and_then(|bytes| snapshot::encode(&bytes))
    .and_then(|encoded| slot.set(key, &encoded));

  if let Err(e) = &result {
    error!(key, error = %e, "Failed to save store");
  }
  result
}

/// Create any missing tables. Idempotent and never destructive.
pub fn ensure_schema(handle: &StoreHandle) -> Result<()> {
  handle
    .conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  Ok(())
}
