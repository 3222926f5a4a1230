// src/core/state/persistence.rs

//! Persistence state: the snapshot-save flag and the AOF hooks the
//! replication core coordinates with. Full AOF persistence is outside this
//! core; what matters here is whether a rewrite is running (it defers
//! replication BGSAVEs) and the disable/restore dance around snapshot loads.

use crate::core::KunziteError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

#[derive(Debug)]
pub struct PersistenceState {
    /// True while a replication BGSAVE (disk or diskless) is serializing.
    pub is_saving: AtomicBool,
    pub aof_enabled: AtomicBool,
    pub aof_rewrite_in_progress: AtomicBool,
    aof_path: PathBuf,
}

impl PersistenceState {
    pub fn new(aof_enabled: bool, aof_path: PathBuf) -> Self {
        Self {
            is_saving: AtomicBool::new(false),
            aof_enabled: AtomicBool::new(aof_enabled),
            aof_rewrite_in_progress: AtomicBool::new(false),
            aof_path,
        }
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving.load(Ordering::SeqCst)
    }

    pub fn aof_enabled(&self) -> bool {
        self.aof_enabled.load(Ordering::SeqCst)
    }

    pub fn is_aof_rewrite_in_progress(&self) -> bool {
        self.aof_rewrite_in_progress.load(Ordering::SeqCst)
    }

    /// Stops any in-flight AOF rewrite and disables the AOF. Called before
    /// loading a snapshot received from a leader; the dataset about to be
    /// loaded invalidates whatever the rewrite was producing.
    pub fn stop_aof_for_sync(&self) -> bool {
        self.aof_rewrite_in_progress.store(false, Ordering::SeqCst);
        let was_enabled = self.aof_enabled.swap(false, Ordering::SeqCst);
        if was_enabled {
            info!("AOF disabled for the duration of the leader sync.");
        }
        was_enabled
    }

    /// Re-enables the AOF after a sync by starting a fresh append-only file.
    /// Fallible: the caller retries a bounded number of times and treats
    /// persistent failure as fatal, since local durability guarantees no
    /// longer hold.
    pub fn start_append_only(&self) -> Result<(), KunziteError> {
        if let Some(parent) = self.aof_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&self.aof_path)?;
        self.aof_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }
}
