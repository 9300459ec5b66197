mod conflict;
mod error;
mod memstore;
mod mutations;
mod queries;
mod store;

pub use conflict::find_conflict;
pub use error::{EngineError, ErrorKind};
pub use memstore::{MemStore, MemTx, RoomState};
pub use store::{Store, StoreError, StoreTx, TxScope};

use std::time::Duration;

use crate::limits::DEFAULT_LOCK_WAIT_MS;

/// The booking coordinator. Every write runs inside one serialized store
/// transaction: validate, check, write, commit. Reads go straight to the
/// store's committed state.
pub struct Engine<S: Store = MemStore> {
    store: S,
    /// How long a write waits for its reservations before giving up.
    lock_wait: Duration,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, lock_wait: Duration) -> Self {
        Self { store, lock_wait }
    }

    pub fn with_default_wait(store: S) -> Self {
        Self::new(store, Duration::from_millis(DEFAULT_LOCK_WAIT_MS))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    /// Commit on success, roll back on error. The transaction is consumed
    /// either way, releasing its reservations.
    async fn finish<T>(tx: S::Tx, staged: Result<T, EngineError>) -> Result<T, EngineError> {
        match staged {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }
}

impl Engine<MemStore> {
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        Ok(self.store.compact(self.lock_wait).await?)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.wal_appends_since_compact().await
    }
}
