// src/server/connection_loop.rs

//! The accept loop: registers each connection and spawns its handler.

use super::initialization::ServerContext;
use crate::connection::ConnectionHandler;
use crate::core::state::{ClientInfo, ClientRole};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub async fn run(ctx: ServerContext) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let max_clients = {
        let config = ctx.state.config.lock().await;
        config.max_clients
    };

    loop {
        tokio::select! {
            accepted = ctx.listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept a connection: {e}");
                        continue;
                    }
                };
                if ctx.state.clients.len() >= max_clients {
                    warn!("Refusing connection from {addr}: max_clients reached.");
                    drop(socket);
                    continue;
                }

                let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                ctx.state.clients.insert(
                    session_id,
                    ClientInfo {
                        addr,
                        session_id,
                        role: ClientRole::Normal,
                        created: now,
                        last_command_time: now,
                    },
                );

                let state = ctx.state.clone();
                let shutdown_rx = ctx.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let mut handler =
                        ConnectionHandler::new(socket, addr, state, session_id, shutdown_rx).await;
                    if let Err(e) = handler.run().await {
                        warn!("Connection handler for {addr} exited with error: {e}");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down.");
                return;
            }
        }
    }
}
