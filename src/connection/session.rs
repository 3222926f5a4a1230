// src/connection/session.rs

//! Defines the state associated with a single client session.

use crate::core::state::ReplicaCapa;
use uuid::Uuid;

/// Holds the state specific to a single client session.
#[derive(Debug)]
pub struct SessionState {
    /// True if the client has successfully authenticated.
    pub is_authenticated: bool,
    /// The index of the database the client is currently using.
    pub current_db_index: usize,
    /// Global replication offset right after this session's last write;
    /// `WAIT` measures follower acknowledgements against it.
    pub last_write_offset: u64,
    /// Replication options declared via REPLCONF ahead of a SYNC/PSYNC.
    pub replconf: ReplconfSession,
}

/// What a prospective follower told us about itself before synchronizing.
#[derive(Debug)]
pub struct ReplconfSession {
    pub capa: ReplicaCapa,
    pub uuid: Uuid,
    pub listening_port: Option<u16>,
    pub announced_ip: Option<String>,
}

impl SessionState {
    pub(crate) fn new(is_auth_required: bool) -> Self {
        Self {
            is_authenticated: !is_auth_required,
            current_db_index: 0,
            last_write_offset: 0,
            replconf: ReplconfSession {
                capa: ReplicaCapa::empty(),
                uuid: Uuid::nil(),
                listening_port: None,
                announced_ip: None,
            },
        }
    }
}
