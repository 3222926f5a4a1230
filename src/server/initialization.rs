// src/server/initialization.rs

//! Builds the server state from the configuration, restores persisted data,
//! and binds the listening socket.

use crate::config::Config;
use crate::core::persistence::snapshot::{SnapshotLoadOptions, load_from_file};
use crate::core::replication::adopt_persisted_identity;
use crate::core::state::{ServerInit, ServerState};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Everything the spawner and the accept loop need.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub reconfigure_rx: Option<broadcast::Receiver<()>>,
}

pub async fn setup(config: Config) -> Result<ServerContext> {
    let addr = format!("{}:{}", config.host, config.port);
    let snapshot_path = config.persistence.snapshot_path.clone();

    let ServerInit {
        state,
        reconfigure_rx,
    } = ServerState::initialize(config.clone())?;

    // Restore the dataset and, crucially for PSYNC after restart, the
    // replication identity the snapshot recorded.
    let path = Path::new(&snapshot_path);
    if path.exists() {
        match load_from_file(path, &state.dbs, &SnapshotLoadOptions::default()).await {
            Ok(report) => {
                info!(
                    "Loaded snapshot '{}' ({} databases configured).",
                    snapshot_path,
                    state.dbs.len()
                );
                adopt_persisted_identity(
                    &state,
                    &report.meta.replid,
                    report.meta.master_repl_offset,
                    &config,
                );
            }
            Err(e) => {
                warn!("Could not load snapshot '{}': {}. Starting empty.", snapshot_path, e);
            }
        }
    }

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!("KunziteDB listening on {}", addr);

    let (shutdown_tx, _) = broadcast::channel(4);
    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        reconfigure_rx: Some(reconfigure_rx),
    })
}
