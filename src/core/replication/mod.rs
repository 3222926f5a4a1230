// src/core/replication/mod.rs

//! The replication subsystem: backlog, identity registry, command fan-out,
//! leader-side sessions with snapshot handoff, follower workers, cached
//! leaders, and the once-per-second cron.

use crate::config::Config;
use crate::core::KunziteError;
use crate::core::replication::cached::CachedPrimary;
use crate::core::state::{LeaderLink, LinkState, ServerState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

pub mod backlog;
pub mod cached;
pub mod primary;
pub mod propagate;
pub mod replica;
pub mod replid;
pub mod snapshot;
pub mod tick;

/// Supervises the follower workers: one per configured upstream leader,
/// respawned whenever REPLICAOF changes the leader set.
pub async fn run_link_supervisor(
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
    mut reconfigure_rx: broadcast::Receiver<()>,
) {
    let mut spawned: HashSet<usize> = HashSet::new();

    loop {
        let links: Vec<Arc<LeaderLink>> = state.replication.leaders.lock().clone();
        for link in links {
            let key = Arc::as_ptr(&link) as usize;
            if spawned.insert(key) {
                let worker = replica::ReplicaWorker::new(state.clone(), link);
                tokio::spawn(worker.run(
                    shutdown_tx.subscribe(),
                    state.replication.reconfigure_tx.subscribe(),
                ));
            }
        }

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::select! {
            _ = reconfigure_rx.recv() => {}
            _ = shutdown_rx.recv() => {
                info!("Replication link supervisor shutting down.");
                return;
            }
        }
    }
}

/// Implements `REPLICAOF <host> <port>`: replaces the leader set with the
/// single given leader. If this instance was a pure leader until now, a
/// cached leader is synthesized from its own identity so a PSYNC with a
/// promoted former follower can resume partially.
pub async fn replicaof_set(
    state: &Arc<ServerState>,
    host: &str,
    port: u16,
) -> Result<(), KunziteError> {
    let active = state.replication.settings.active_replica;
    let link = Arc::new(LeaderLink::new(host.to_string(), port));

    {
        let mut leaders = state.replication.leaders.lock();
        let was_leader = leaders.is_empty();
        let mut core = state.replication.core.lock();

        if was_leader {
            info!(
                "Before turning into a replica, using my own parameters to synthesize \
                 a cached leader: I may be able to synchronize with the new leader \
                 with just a partial transfer."
            );
            *link.cached.lock() = Some(CachedPrimary::from_own_identity(
                &core.identity.primary_id,
                core.master_repl_offset,
            ));
        }

        // Followers must resync against the new topology; with PSYNC v2
        // they come back with a cheap partial resync.
        if !active {
            core.disconnect_followers_except(Uuid::nil());
        }
        for old in leaders.iter() {
            old.set_state(LinkState::None);
        }
        *leaders = vec![link];
    }

    info!("REPLICAOF {}:{} enabled.", host, port);
    let _ = state.replication.reconfigure_tx.send(());
    Ok(())
}

/// Implements `REPLICAOF NO ONE`: drops every leader link and promotes this
/// instance. The shift keeps the inherited replication ID answerable as the
/// secondary ID, so existing sub-followers partial-resync instead of
/// retransferring.
pub async fn replicaof_no_one(state: &Arc<ServerState>) -> Result<(), KunziteError> {
    let active = state.replication.settings.active_replica;
    {
        let mut leaders = state.replication.leaders.lock();
        if leaders.is_empty() {
            return Ok(());
        }
        for link in leaders.iter() {
            link.set_state(LinkState::None);
            *link.cached.lock() = None;
        }
        leaders.clear();

        let mut core = state.replication.core.lock();
        let offset = core.master_repl_offset;
        core.identity.promote_to_leader(offset);
        core.replica_seldb = None;
        core.no_followers_since = Some(std::time::Instant::now());
        if !active {
            core.disconnect_followers_except(Uuid::nil());
        }
    }
    info!("LEADER MODE enabled.");
    let _ = state.replication.reconfigure_tx.send(());
    Ok(())
}

/// Restores the replication identity recorded in a snapshot loaded at
/// startup, so a restarted follower can attempt PSYNC with its old position.
pub fn adopt_persisted_identity(state: &Arc<ServerState>, replid: &str, offset: u64, config: &Config) {
    if replid.len() != replid::REPL_ID_LEN || replid.bytes().all(|b| b == b'0') {
        return;
    }
    let mut core = state.replication.core.lock();
    core.identity.replace_primary(replid);
    core.master_repl_offset = offset;
    info!(
        "Restored replication identity from snapshot: {} at offset {}.",
        replid, offset
    );

    // A restarting follower also gets a synthesized cached leader, so its
    // first PSYNC can resume where the snapshot left off.
    let leaders = state.replication.leaders.lock();
    if let Some(first) = leaders.first() {
        if !config.replication.active_replica {
            *first.cached.lock() = Some(CachedPrimary::from_own_identity(replid, offset));
        }
    }
}
