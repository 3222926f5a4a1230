// src/core/replication/snapshot.rs

//! Snapshot handoff: one background save serves every follower waiting for a
//! full resynchronization.
//!
//! A follower entering WAIT_BGSAVE_START either attaches to a save already
//! in flight (disk target only, and only when its capabilities are covered),
//! waits for the next one, or triggers one. When the save starts, each
//! attached follower gets its `+FULLRESYNC` header and begins accumulating
//! stream diffs; when it completes, the payload is parked on the follower
//! record and the owning session streams it out.

use crate::core::persistence::snapshot::{SnapshotMeta, save_to_bytes, save_to_file};
use crate::core::replication::replid::random_repl_id;
use crate::core::state::{
    BulkHandoff, FollowerSyncState, ReplicaCapa, SaveInProgress, SaveTarget, ServerState,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

/// Decides how a follower that just entered WAIT_BGSAVE_START gets its
/// snapshot. Mirrors the three cases of the sync command: attach to the
/// running disk save, wait for the next save, or start one now.
pub async fn schedule_full_sync(state: &Arc<ServerState>, session_id: u64) {
    let start_now = {
        let mut core = state.replication.core.lock();
        let Some(new_follower) = core.followers.get(&session_id) else {
            return;
        };
        let new_capa = new_follower.capa;

        match core.save.as_ref().map(|s| s.target) {
            Some(SaveTarget::Disk) => {
                // A save is already registering diffs for someone. Attach if
                // that follower's capability set is covered by ours, by
                // copying its accumulated output and save-start offset.
                let donor = core
                    .followers
                    .values()
                    .find(|f| {
                        f.session_id != session_id && f.state == FollowerSyncState::WaitBgsaveEnd
                    })
                    .map(|f| (f.session_id, f.capa, f.psync_initial_offset, f.stream.clone()));
                match donor {
                    Some((_, donor_capa, donor_offset, donor_stream))
                        if new_capa.contains(donor_capa) =>
                    {
                        let header = fullresync_header(&core.identity.primary_id, donor_offset);
                        if let Some(follower) = core.followers.get_mut(&session_id) {
                            follower.stream = donor_stream;
                            follower.psync_initial_offset = donor_offset;
                            follower.state = FollowerSyncState::WaitBgsaveEnd;
                            if !follower.pre_psync {
                                follower.queue_immediate(header);
                            } else {
                                follower.notify.notify_one();
                            }
                            info!("Waiting for end of BGSAVE for SYNC (attached to running save).");
                        }
                        false
                    }
                    _ => {
                        info!(
                            "Can't attach the replica to the current BGSAVE. \
                             Waiting for next BGSAVE for SYNC."
                        );
                        false
                    }
                }
            }
            Some(SaveTarget::Socket) => {
                // Socket saves stream directly; late arrivals wait.
                info!("Current BGSAVE has socket target. Waiting for next BGSAVE for SYNC.");
                false
            }
            None => {
                let settings = &state.replication.settings;
                if settings.diskless_sync && new_capa.contains(ReplicaCapa::EOF) {
                    // The cron starts diskless saves after a delay so more
                    // followers can share the stream.
                    info!("Delay next BGSAVE for diskless SYNC.");
                    false
                } else if state.persistence.is_aof_rewrite_in_progress() {
                    info!(
                        "No BGSAVE in progress, but an AOF rewrite is active. \
                         BGSAVE for replication delayed."
                    );
                    false
                } else {
                    true
                }
            }
        }
    };

    if start_now {
        let mincapa = {
            let core = state.replication.core.lock();
            core.followers
                .get(&session_id)
                .map(|f| f.capa)
                .unwrap_or(ReplicaCapa::empty())
        };
        start_save_for_replication(state, mincapa).await;
    }
}

/// Starts the background save for every follower currently in
/// WAIT_BGSAVE_START. `mincapa` is the intersection of their capabilities
/// and picks the target: socket iff diskless sync is enabled and every
/// waiter understands EOF transfers.
pub async fn start_save_for_replication(state: &Arc<ServerState>, mincapa: ReplicaCapa) {
    let snapshot_path = {
        let config = state.config.lock().await;
        PathBuf::from(&config.persistence.snapshot_path)
    };

    let (target, meta) = {
        let mut core = state.replication.core.lock();
        if core.save.is_some() {
            return;
        }
        let target = if state.replication.settings.diskless_sync
            && mincapa.contains(ReplicaCapa::EOF)
        {
            SaveTarget::Socket
        } else {
            SaveTarget::Disk
        };
        let start_offset = core.master_repl_offset;
        core.save = Some(SaveInProgress {
            target,
            start_offset,
        });

        // Every waiter is promoted to WAIT_BGSAVE_END now: the save will
        // reflect the dataset at this offset and diffs accumulate from here.
        let header = fullresync_header(&core.identity.primary_id, start_offset);
        let mut any = false;
        for follower in core.followers.values_mut() {
            if follower.state != FollowerSyncState::WaitBgsaveStart {
                continue;
            }
            any = true;
            follower.psync_initial_offset = start_offset;
            follower.state = FollowerSyncState::WaitBgsaveEnd;
            follower.last_interaction = Instant::now();
            if !follower.pre_psync {
                follower.queue_immediate(header.clone());
            } else {
                follower.notify.notify_one();
            }
        }
        if !any {
            core.save = None;
            return;
        }
        // Force a SELECT on the first fan-out after the cut-over.
        core.replica_seldb = None;

        let meta = SnapshotMeta {
            replid: core.identity.primary_id.clone(),
            master_repl_offset: start_offset,
            selected_db: 0,
        };
        (target, meta)
    };

    state.persistence.is_saving.store(true, Ordering::SeqCst);
    info!(
        "Starting BGSAVE for SYNC with target: {}",
        match target {
            SaveTarget::Disk => "disk",
            SaveTarget::Socket => "replica sockets",
        }
    );

    let state = state.clone();
    tokio::spawn(async move {
        let result = run_save(&state, target, meta, snapshot_path).await;
        finish_save(&state, result);
    });
}

async fn run_save(
    state: &Arc<ServerState>,
    target: SaveTarget,
    meta: SnapshotMeta,
    snapshot_path: PathBuf,
) -> Result<BulkHandoff, String> {
    match target {
        SaveTarget::Disk => {
            let size = save_to_file(&snapshot_path, &state.dbs, &meta)
                .await
                .map_err(|e| e.to_string())?;
            Ok(BulkHandoff::DiskFile {
                path: snapshot_path,
                size,
            })
        }
        SaveTarget::Socket => {
            let payload = save_to_bytes(&state.dbs, &meta).map_err(|e| e.to_string())?;
            Ok(BulkHandoff::SocketPayload {
                payload,
                eof_mark: Bytes::from(random_repl_id()),
            })
        }
    }
}

/// Applies the save outcome to every attached follower and clears the
/// in-progress marker.
fn finish_save(state: &Arc<ServerState>, result: Result<BulkHandoff, String>) {
    state.persistence.is_saving.store(false, Ordering::SeqCst);
    let mut core = state.replication.core.lock();
    core.save = None;
    match result {
        Ok(handoff) => {
            for follower in core.followers.values_mut() {
                if follower.state != FollowerSyncState::WaitBgsaveEnd {
                    continue;
                }
                follower.pending_bulk = Some(handoff.clone());
                follower.state = FollowerSyncState::SendBulk;
                follower.notify.notify_one();
            }
        }
        Err(e) => {
            warn!("BGSAVE for replication failed: {e}");
            for follower in core.followers.values_mut() {
                if follower.state != FollowerSyncState::WaitBgsaveEnd {
                    continue;
                }
                follower
                    .queue_immediate(Bytes::from_static(b"-ERR BGSAVE failed, replication can't continue\r\n"));
                follower.closing = true;
                follower.notify.notify_one();
            }
        }
    }
}

/// Builds the `+FULLRESYNC <replid> <offset>\r\n` header bytes.
pub fn fullresync_header(replid: &str, offset: u64) -> Bytes {
    Bytes::from(format!("+FULLRESYNC {replid} {offset}\r\n"))
}
