// src/core/state/client.rs

//! Contains state definitions related to client connections.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub type ClientMap = Arc<DashMap<u64, ClientInfo>>;

/// What a connection is, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Normal,
    /// Reclassified by SYNC/PSYNC: this connection receives our stream.
    Follower,
}

#[derive(Debug)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub session_id: u64,
    pub role: ClientRole,
    pub created: Instant,
    pub last_command_time: Instant,
}
