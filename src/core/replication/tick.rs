// src/core/replication/tick.rs

//! The once-per-second replication cron: heartbeats, timeouts, deferred
//! background saves, backlog reclamation, stale-key emission, and the
//! good-follower count.

use crate::core::replication::propagate::{propagate_ping, propagate_write};
use crate::core::replication::snapshot::start_save_for_replication;
use crate::core::state::{FollowerSyncState, LinkState, ReplicaCapa, SaveTarget, ServerState};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const CRON_INTERVAL: Duration = Duration::from_secs(1);

/// The background task running the replication cron.
pub struct ReplicationCronTask {
    state: Arc<ServerState>,
}

impl ReplicationCronTask {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Replication cron task started.");
        let mut interval = tokio::time::interval(CRON_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut loops: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_round(loops).await;
                    loops += 1;
                }
                _ = shutdown_rx.recv() => {
                    info!("Replication cron task shutting down.");
                    return;
                }
            }
        }
    }

    /// One cron round. Public so the individual duties can be exercised
    /// without a timer.
    pub async fn run_round(&self, loops: u64) {
        let settings = self.state.replication.settings.clone();

        // Periodic PING keeps follower timeout detection alive even when no
        // writes flow.
        if loops % settings.ping_replica_period_secs == 0 {
            propagate_ping(&self.state);
        }

        let mut start_save_mincapa: Option<ReplicaCapa> = None;
        // Lock order across the crate is leaders before core.
        let is_leader_only = self.state.replication.leaders.lock().is_empty();
        {
            let mut core = self.state.replication.core.lock();

            // Pre-sync followers get a bare newline so they know we are
            // alive while the save runs; it is valid protocol that does not
            // move offsets. Socket-target saves stream payload instead.
            let save_target = core.save.as_ref().map(|s| s.target);
            for follower in core.followers.values_mut() {
                let is_presync = follower.state == FollowerSyncState::WaitBgsaveStart
                    || (follower.state == FollowerSyncState::WaitBgsaveEnd
                        && save_target != Some(SaveTarget::Socket));
                if is_presync && !follower.closing {
                    follower.queue_immediate(Bytes::from_static(b"\n"));
                }
            }

            // Disconnect followers whose ACKs dried up. Legacy-SYNC
            // followers never ACK and are exempt.
            for follower in core.followers.values_mut() {
                if follower.state != FollowerSyncState::Online
                    || follower.pre_psync
                    || follower.closing
                {
                    continue;
                }
                if follower.ack_time.elapsed().as_secs() > settings.repl_timeout_secs {
                    warn!("Disconnecting timedout replica: {}", follower.addr);
                    follower.closing = true;
                    follower.notify.notify_one();
                }
            }

            // Reclaim the backlog after a configured stretch with no
            // followers. The primary ID rotates with it: without a backlog
            // the offset no longer advances, and keeping the old ID could
            // let a later PSYNC resume across missing history.
            if core.followers.is_empty()
                && is_leader_only
                && core.backlog.is_some()
                && settings.backlog_time_limit_secs > 0
            {
                let idle = core
                    .no_followers_since
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or(0);
                if idle > settings.backlog_time_limit_secs {
                    core.identity.rotate_primary();
                    core.identity.clear_secondary();
                    core.free_backlog();
                    info!(
                        "Replication backlog freed after {} seconds without connected replicas.",
                        settings.backlog_time_limit_secs
                    );
                }
            }

            // Launch the deferred save for waiting followers. Diskless syncs
            // wait out the configured delay so more followers can share one
            // stream.
            if core.save.is_none()
                && !self.state.persistence.is_saving()
                && !self.state.persistence.is_aof_rewrite_in_progress()
            {
                let mut mincapa: Option<ReplicaCapa> = None;
                let mut max_idle = 0u64;
                let mut waiting = 0usize;
                for follower in core.followers.values() {
                    if follower.state != FollowerSyncState::WaitBgsaveStart {
                        continue;
                    }
                    waiting += 1;
                    max_idle = max_idle.max(follower.last_interaction.elapsed().as_secs());
                    mincapa = Some(match mincapa {
                        Some(capa) => capa & follower.capa,
                        None => follower.capa,
                    });
                }
                if waiting > 0
                    && (!settings.diskless_sync || max_idle > settings.diskless_sync_delay_secs)
                {
                    start_save_mincapa = mincapa;
                }
            }

            core.refresh_good_follower_count(settings.min_replicas_max_lag_secs);
        }

        if let Some(mincapa) = start_save_mincapa {
            start_save_for_replication(&self.state, mincapa).await;
        }

        self.emit_stale_keys();
    }

    /// Emits the DELs queued by an active-replica full resync, once the link
    /// that produced them is streaming again. The upstream leader's UUID is
    /// used as originator so the deletion does not bounce back to it.
    fn emit_stale_keys(&self) {
        if !self.state.replication.settings.active_replica {
            return;
        }
        let links: Vec<_> = self.state.replication.leaders.lock().clone();
        for link in links {
            if link.link_state() != LinkState::Connected {
                continue;
            }
            let pending: Vec<_> = std::mem::take(&mut *link.stale_keys.lock());
            if pending.is_empty() {
                continue;
            }
            info!(
                "Propagating {} stale-key deletions from leader {}:{}",
                pending.len(),
                link.host,
                link.port
            );
            let origin = *link.master_uuid.lock();
            for (db_index, key) in pending {
                let mvcc = self.state.mvcc_clock.next();
                propagate_write(
                    &self.state,
                    db_index,
                    &[Bytes::from_static(b"DEL"), key],
                    origin,
                    mvcc,
                );
            }
        }
    }
}
