mod error;
mod tables;
mod txn;

pub use error::StoreError;
pub use tables::Tables;
pub use txn::Txn;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::WalRecord;
use crate::observability;
use crate::wal::Wal;

// ── WAL writer channel ───────────────────────────────────

enum WalCommand {
    Append {
        record: WalRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<WalRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL file.
///
/// Appends arrive one at a time: a committing block holds the table write lock
/// until its record is durable, so there is never a second append to batch with.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let flush_start = Instant::now();
                let result = wal.append(&record);
                metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                let _ = response.send(result);
            }
            WalCommand::Compact { records, response } => {
                let _ = response.send(wal.compact(&records));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
            WalCommand::Shutdown { response } => {
                let _ = response.send(wal.flush_sync());
                info!("WAL writer stopped: {}", wal.path().display());
                break;
            }
        }
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, record: WalRecord) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { record, response: tx })
        .await
        .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
        .map_err(StoreError::from)
}

/// Durable slot/booking storage: in-memory tables materialised from a write-ahead log.
///
/// All writes go through [`Store::atomic`]. Blocks are serialized by the table write lock,
/// which is held until the block's WAL record is fsynced and applied. Readers take the read
/// lock and only ever observe committed state.
pub struct Store {
    tables: Arc<RwLock<Tables>>,
    wal_tx: mpsc::Sender<WalCommand>,
    lock_timeout: Duration,
}

impl Store {
    /// Replay the WAL at `path`, verify the schema invariants, and start the writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self, StoreError> {
        let records = Wal::replay(path)?;
        let mut tables = Tables::default();
        for record in &records {
            for event in &record.events {
                tables.apply(event);
            }
        }
        tables.verify()?;

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(1024);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        info!(
            "store opened: {} ({} records, {} slots, {} bookings)",
            path.display(),
            records.len(),
            tables.slot_count(),
            tables.booking_count()
        );

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            wal_tx,
            lock_timeout,
        })
    }

    /// Run `f` as one atomic unit of work.
    ///
    /// `f` works against a [`Txn`] that sees committed state plus its own writes. If `f`
    /// returns `Ok`, its writes are logged as a single WAL record, fsynced, and then made
    /// visible. If `f` returns `Err` (or panics), or the log write fails, nothing it
    /// staged is kept.
    ///
    /// Once `f` has returned `Ok` the commit runs on its own task, so dropping the returned
    /// future cannot leave a logged record unapplied.
    pub async fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let wait_start = Instant::now();
        let mut guard = tokio::time::timeout(self.lock_timeout, self.tables.clone().write_owned())
            .await
            .map_err(|_| {
                StoreError::Io(format!(
                    "timed out after {}ms waiting for the write lock",
                    self.lock_timeout.as_millis()
                ))
            })?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());

        let mut txn = Txn::new(&guard);
        let txn_id = txn.id();
        let value = f(&mut txn)?;
        let events = txn.into_events();
        if events.is_empty() {
            return Ok(value);
        }

        let record = WalRecord { txn: txn_id, events };
        let wal_tx = self.wal_tx.clone();
        let commit = tokio::spawn(async move {
            let events = record.events.clone();
            wal_append(&wal_tx, record).await?;
            for event in &events {
                guard.apply(event);
            }
            metrics::counter!(observability::COMMITS_TOTAL).increment(1);
            debug!("committed txn {txn_id} ({} events)", events.len());
            Ok::<_, StoreError>(())
        });
        commit
            .await
            .map_err(|e| StoreError::Io(format!("commit task failed: {e}")))??;
        Ok(value)
    }

    /// Run a read-only projection over committed state.
    pub async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.tables.read().await;
        f(&guard)
    }

    /// Rewrite the WAL as a single snapshot record of the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        // The read lock keeps committing blocks out until the swap is done.
        let guard = self.tables.read().await;
        let events = guard.snapshot_events();
        let records = if events.is_empty() {
            Vec::new()
        } else {
            vec![WalRecord { txn: Ulid::new(), events }]
        };

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?;
        drop(guard);
        result.map_err(StoreError::from)
    }

    /// Appends since the last compaction, or 0 once the writer has stopped.
    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            debug!("append count unavailable: WAL writer shut down");
            return 0;
        }
        match rx.await {
            Ok(n) => n,
            Err(_) => {
                debug!("append count unavailable: WAL writer dropped response");
                0
            }
        }
    }

    /// Flush and stop the WAL writer. Every later write fails with [`StoreError::Io`].
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .map_err(|_| StoreError::Io("WAL writer already shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(StoreError::from)
    }
}
