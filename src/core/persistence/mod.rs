// src/core/persistence/mod.rs

//! Snapshot (KZDB) encoding/decoding and the AOF restore hook used after a
//! leader sync.

pub mod snapshot;

use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Number of attempts to re-enable the AOF after a sync before giving up.
const AOF_RESTART_MAX_TRIES: u32 = 10;

/// Re-enables the AOF after a leader synchronization. Retries once per
/// second; persistent failure terminates the process, because the instance
/// finished a sync it can no longer make durable and local data is in an
/// undefined state relative to the configured guarantees.
pub async fn restart_aof_after_sync(state: &Arc<ServerState>) {
    for _ in 0..AOF_RESTART_MAX_TRIES {
        match state.persistence.start_append_only() {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    "Failed enabling the AOF after successful leader synchronization ({e}). \
                     Trying it again in one second."
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    error!(
        "FATAL: this replica instance finished the synchronization with its leader, \
         but the AOF can't be turned on. Exiting now."
    );
    std::process::exit(1);
}
