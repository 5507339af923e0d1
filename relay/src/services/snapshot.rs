//! Snapshot persistence — periodic JSON dump of the card store.
//!
//! DESIGN
//! ======
//! A background task subscribes to store changes and marks the store dirty.
//! Every interval it writes the snapshot if dirty: serialize under a read
//! lock, then do file I/O lock-free. Writes go to a sibling temp file that
//! is renamed over the target, so a crash mid-write never leaves a torn
//! snapshot behind.
//!
//! ERROR HANDLING
//! ==============
//! The dirty flag is cleared only after a successful write; a failed write
//! is logged and retried on the next tick. A missing snapshot file means an
//! empty store; a corrupt one is logged and ignored.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::store::{SharedStore, StoreSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot json invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read a snapshot file. `Ok(None)` when the file does not exist.
///
/// # Errors
///
/// Returns [`SnapshotError`] when the file cannot be read or parsed.
pub async fn load(path: &Path) -> Result<Option<StoreSnapshot>, SnapshotError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(SnapshotError::Io { path: path.to_owned(), source }),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Load the snapshot at `path` into the store, if there is a usable one.
pub async fn restore_into(store: &SharedStore, path: &Path) -> bool {
    match load(path).await {
        Ok(Some(snapshot)) => {
            let boards = snapshot.boards.len();
            let cards = snapshot.total_cards();
            store.write().await.restore(snapshot);
            info!(path = %path.display(), boards, cards, "snapshot: restored");
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "snapshot: ignoring unreadable snapshot");
            false
        }
    }
}

/// Write `snapshot` to `path` via temp file + rename.
///
/// # Errors
///
/// Returns [`SnapshotError`] when serialization or any file operation fails.
pub async fn write_atomic(path: &Path, snapshot: &StoreSnapshot) -> Result<(), SnapshotError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let io_err = |source| SnapshotError::Io { path: path.to_owned(), source };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// Spawn the background snapshot task. It flushes once more on shutdown.
pub fn spawn_snapshot_task(
    store: SharedStore,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(path = %path.display(), interval_ms = interval.as_millis(), "snapshot persistence configured");
    tokio::spawn(async move {
        let (subscriber, mut changes) = store.write().await.subscribe_channel();
        let mut dirty = false;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                change = changes.recv() => {
                    if change.is_none() {
                        break;
                    }
                    dirty = true;
                }
                _ = ticker.tick() => {
                    if dirty && flush(&store, &path).await {
                        dirty = false;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Drain changes that raced the shutdown signal.
        while changes.try_recv().is_ok() {
            dirty = true;
        }
        if dirty {
            flush(&store, &path).await;
        }
        store.write().await.unsubscribe(subscriber);
    })
}

async fn flush(store: &SharedStore, path: &Path) -> bool {
    let snapshot = store.read().await.snapshot();
    match write_atomic(path, &snapshot).await {
        Ok(()) => {
            info!(path = %path.display(), cards = snapshot.total_cards(), "snapshot: written");
            true
        }
        Err(e) => {
            error!(error = %e, "snapshot: write failed; will retry");
            false
        }
    }
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
