// src/server/spawner.rs

//! Spawns the server's long-running background tasks.

use super::initialization::ServerContext;
use crate::core::replication::run_link_supervisor;
use crate::core::replication::tick::ReplicationCronTask;
use tracing::{error, info};

pub fn spawn_all(ctx: &mut ServerContext) {
    // The replication cron: heartbeats, timeouts, deferred saves.
    let cron = ReplicationCronTask::new(ctx.state.clone());
    tokio::spawn(cron.run(ctx.shutdown_tx.subscribe()));

    // The link supervisor: one follower worker per configured leader,
    // respawned when REPLICAOF changes the set.
    if let Some(reconfigure_rx) = ctx.reconfigure_rx.take() {
        tokio::spawn(run_link_supervisor(
            ctx.state.clone(),
            ctx.shutdown_tx.clone(),
            reconfigure_rx,
        ));
    }

    // Ctrl-C translates into the broadcast every task listens on.
    let shutdown_tx = ctx.shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received. Notifying all tasks.");
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("Failed to listen for the shutdown signal: {e}"),
        }
    });
}
