// src/core/replication/cached.rs

//! The cached leader: what a follower keeps of a broken leader link so a
//! later PSYNC can resume instead of transferring a full snapshot.

/// The stream position preserved from a disconnected leader.
///
/// Created on abnormal disconnection of a connected link, or synthesized from
/// this instance's own identity when a leader is demoted to follower
/// (self-promotion of a former follower elsewhere). Destroyed when a full
/// resync is decided; resurrected by `+CONTINUE`.
#[derive(Debug, Clone)]
pub struct CachedPrimary {
    /// Replication ID of the stream we were consuming.
    pub replid: String,
    /// Last stream offset fully processed; the next PSYNC asks for
    /// `reploff + 1`.
    pub reploff: u64,
    /// DB index the stream had selected, restored on resurrection so the
    /// leader need not re-emit SELECT.
    pub selected_db: usize,
}

impl CachedPrimary {
    /// Synthesizes a cached leader from this instance's own primary ID and
    /// offset. Used when a leader is reconfigured to follow a node that was
    /// promoted from its own follower set: the promoted node inherited our
    /// replication history, so a PSYNC with our own parameters may succeed.
    pub fn from_own_identity(primary_id: &str, master_repl_offset: u64) -> Self {
        Self {
            replid: primary_id.to_string(),
            reploff: master_repl_offset,
            selected_db: 0,
        }
    }
}
