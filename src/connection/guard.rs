// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource cleanup.

use crate::core::state::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Ensures connection resources are cleaned up when a connection handler's
/// scope exits, unless the connection was handed off to a follower session.
pub struct ConnectionGuard {
    state: Arc<ServerState>,
    session_id: u64,
    addr: SocketAddr,
    is_handed_off: bool,
}

impl ConnectionGuard {
    pub(crate) fn new(state: Arc<ServerState>, session_id: u64, addr: SocketAddr) -> Self {
        Self {
            state,
            session_id,
            addr,
            is_handed_off: false,
        }
    }

    /// Marks the connection as handed off; the follower session owns cleanup
    /// from here.
    pub(crate) fn set_handed_off(&mut self) {
        self.is_handed_off = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.is_handed_off {
            debug!(
                "Skipping cleanup for {}: connection handed off to a follower session.",
                self.addr
            );
            return;
        }
        self.state.clients.remove(&self.session_id);
        debug!("Cleaned up resources for connection {}.", self.addr);
    }
}
