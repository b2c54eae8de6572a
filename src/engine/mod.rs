mod error;
pub mod ledger;
mod lifecycle;
mod queries;

pub use error::EngineError;
pub use lifecycle::Cancellation;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::store::Store;

/// Slot and booking operations over one [`Store`].
///
/// Cheap to share: request tasks hold an `Arc<Engine>` and call it concurrently. Every
/// mutating operation runs as a single atomic block.
pub struct Engine {
    store: Arc<Store>,
}

impl Engine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Open (or create) the store backed by the WAL at `wal_path`.
    pub fn open(wal_path: &Path, lock_timeout: Duration) -> Result<Self, EngineError> {
        let store = Store::open(wal_path, lock_timeout)?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Flush and close the store. Later writes fail with `IoFailure`.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.store.shutdown().await?;
        Ok(())
    }
}
