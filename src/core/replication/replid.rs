// src/core/replication/replid.rs

//! The replication ID registry: the 40-hex-char lineage identifiers that
//! decide whether a PSYNC request may resume a stream.

use rand::RngCore;

/// Length of a replication ID in hex characters.
pub const REPL_ID_LEN: usize = 40;

/// Draws a fresh random replication ID.
pub fn random_repl_id() -> String {
    let mut raw = [0u8; REPL_ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// The identity of this instance's replication history.
///
/// `primary_id` names the current lineage. `secondary_id` is the previous
/// lineage, honored for PSYNC up to `secondary_valid_until_offset`; this is
/// what lets a follower of a just-promoted leader resume without a full
/// transfer.
#[derive(Debug, Clone)]
pub struct ReplicationIdentity {
    pub primary_id: String,
    pub secondary_id: String,
    pub secondary_valid_until_offset: i64,
}

impl ReplicationIdentity {
    pub fn new() -> Self {
        Self {
            primary_id: random_repl_id(),
            secondary_id: "0".repeat(REPL_ID_LEN),
            secondary_valid_until_offset: -1,
        }
    }

    /// Replaces the primary ID with a fresh random one. Called whenever the
    /// dataset's story diverges: promotion, backlog reclamation, topology
    /// change.
    pub fn rotate_primary(&mut self) {
        self.primary_id = random_repl_id();
    }

    /// The promotion shift: the current primary becomes the secondary, valid
    /// up to `master_repl_offset + 1` (the first byte a former follower will
    /// ask for is the one after the last it received), then a new primary is
    /// drawn.
    pub fn promote_to_leader(&mut self, master_repl_offset: u64) {
        self.secondary_id = self.primary_id.clone();
        self.secondary_valid_until_offset = master_repl_offset as i64 + 1;
        self.rotate_primary();
    }

    /// XOR-merges another ID into the primary, nibble by nibble. Two active
    /// peers that merge each other's IDs converge to the same value; merging
    /// the same ID twice is the identity.
    pub fn merge_primary(&mut self, other: &str) {
        const CHARSET: &[u8] = b"0123456789abcdef";
        let merged: String = self
            .primary_id
            .bytes()
            .zip(other.bytes())
            .map(|(a, b)| CHARSET[(hex_nibble(a) ^ hex_nibble(b)) as usize] as char)
            .collect();
        self.primary_id = merged;
    }

    /// Invalidates the secondary ID, e.g. after a full resynchronization
    /// starts a new history.
    pub fn clear_secondary(&mut self) {
        self.secondary_id = "0".repeat(REPL_ID_LEN);
        self.secondary_valid_until_offset = -1;
    }

    /// Adopts a leader's ID wholesale (non-active full resync).
    pub fn replace_primary(&mut self, id: &str) {
        self.primary_id = id.to_string();
    }
}

impl Default for ReplicationIdentity {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_nibble(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => 0,
    }
}
