// src/core/commands/command_trait.rs

//! Defines the core traits for all executable commands.

use crate::core::KunziteError;
use crate::core::protocol::RespFrame;
use crate::core::state::ServerState;
use crate::core::storage::Db;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;

bitflags! {
    /// Flags describing the properties and behavior of a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u32 {
        /// The command modifies the dataset.
        const WRITE        = 1 << 0;
        /// The command only reads data.
        const READONLY     = 1 << 1;
        /// An administrative command.
        const ADMIN        = 1 << 2;
        /// Never forwarded to followers.
        const NO_PROPAGATE = 1 << 3;
        /// Handled by the connection layer rather than the execution path
        /// (needs the session or performs a protocol switch).
        const CONNECTION   = 1 << 4;
    }
}

/// The outcome of a write, deciding whether propagation is warranted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    DidNotWrite,
    Write { keys_modified: u64 },
    Delete { keys_deleted: u64 },
    Flush,
}

impl WriteOutcome {
    pub fn wrote(&self) -> bool {
        !matches!(self, WriteOutcome::DidNotWrite)
    }
}

/// Everything a command needs to run.
pub struct ExecutionContext {
    pub state: Arc<ServerState>,
    /// The database the session (or the leader stream) has selected.
    pub db: Arc<Db>,
    pub db_index: usize,
    pub session_id: u64,
    /// MVCC stamp applied to any write this command performs.
    pub mvcc: u64,
    /// When true, writes apply last-write-wins against the stamp already
    /// stored (commands replayed from a peer's stream).
    pub apply_lww: bool,
}

/// The execution logic of a command, implemented by each command struct.
#[async_trait]
pub trait ExecutableCommand {
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError>;
}

/// Parsing a command's arguments from a slice of `RespFrame`s.
pub trait ParseCommand: Sized {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError>;
}

/// Static description of a command, used for dispatch and re-serialization
/// when a command is propagated.
pub trait CommandSpec {
    fn name(&self) -> &'static str;
    fn arity(&self) -> i64;
    fn flags(&self) -> CommandFlags;
    /// The command's arguments (without the name) as raw RESP parts.
    fn to_resp_args(&self) -> Vec<Bytes>;
}
