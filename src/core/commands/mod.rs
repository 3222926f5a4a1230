// src/core/commands/mod.rs

//! All supported commands, the central `Command` enum that encapsulates
//! their parsed state, and the dispatch glue.

pub mod command_trait;
pub mod generic;
pub mod helpers;
pub mod string;

pub use command_trait::{CommandFlags, CommandSpec, ExecutionContext, WriteOutcome};

use crate::core::KunziteError;
use crate::core::protocol::RespFrame;
use bytes::Bytes;
use command_trait::{ExecutableCommand, ParseCommand};
use generic::{
    Auth, DbSize, Del, Echo, FlushAll, Info, Ping, Psync, Replconf, ReplicaOf, Role, Rreplay,
    Select, SyncCmd, Wait,
};
use string::{Get, Set};

/// A fully parsed command.
#[derive(Debug, Clone)]
pub enum Command {
    Ping(Ping),
    Echo(Echo),
    Auth(Auth),
    Select(Select),
    Get(Get),
    Set(Set),
    Del(Del),
    FlushAll(FlushAll),
    DbSize(DbSize),
    Info(Info),
    Role(Role),
    Replconf(Replconf),
    Psync(Psync),
    Sync(SyncCmd),
    ReplicaOf(ReplicaOf),
    Wait(Wait),
    Rreplay(Rreplay),
}

impl TryFrom<RespFrame> for Command {
    type Error = KunziteError;

    fn try_from(frame: RespFrame) -> Result<Self, Self::Error> {
        let RespFrame::Array(parts) = frame else {
            return Err(KunziteError::SyntaxError);
        };
        if parts.is_empty() {
            return Err(KunziteError::SyntaxError);
        }
        let name = match &parts[0] {
            RespFrame::BulkString(b) => String::from_utf8_lossy(b).to_ascii_lowercase(),
            RespFrame::SimpleString(s) => s.to_ascii_lowercase(),
            _ => return Err(KunziteError::SyntaxError),
        };
        let args = &parts[1..];

        let command = match name.as_str() {
            "ping" => Command::Ping(Ping::parse(args)?),
            "echo" => Command::Echo(Echo::parse(args)?),
            "auth" => Command::Auth(Auth::parse(args)?),
            "select" => Command::Select(Select::parse(args)?),
            "get" => Command::Get(Get::parse(args)?),
            "set" => Command::Set(Set::parse(args)?),
            "del" => Command::Del(Del::parse(args)?),
            "flushall" => Command::FlushAll(FlushAll::parse(args)?),
            "dbsize" => Command::DbSize(DbSize::parse(args)?),
            "info" => Command::Info(Info::parse(args)?),
            "role" => Command::Role(Role::parse(args)?),
            "replconf" => Command::Replconf(Replconf::parse(args)?),
            "psync" => Command::Psync(Psync::parse(args)?),
            "sync" => Command::Sync(SyncCmd::parse(args)?),
            "replicaof" | "slaveof" => Command::ReplicaOf(ReplicaOf::parse(args)?),
            "wait" => Command::Wait(Wait::parse(args)?),
            "rreplay" => Command::Rreplay(Rreplay::parse(args)?),
            _ => return Err(KunziteError::UnknownCommand(name)),
        };
        Ok(command)
    }
}

macro_rules! for_each_command {
    ($self:ident, $cmd:ident => $body:expr) => {
        match $self {
            Command::Ping($cmd) => $body,
            Command::Echo($cmd) => $body,
            Command::Auth($cmd) => $body,
            Command::Select($cmd) => $body,
            Command::Get($cmd) => $body,
            Command::Set($cmd) => $body,
            Command::Del($cmd) => $body,
            Command::FlushAll($cmd) => $body,
            Command::DbSize($cmd) => $body,
            Command::Info($cmd) => $body,
            Command::Role($cmd) => $body,
            Command::Replconf($cmd) => $body,
            Command::Psync($cmd) => $body,
            Command::Sync($cmd) => $body,
            Command::ReplicaOf($cmd) => $body,
            Command::Wait($cmd) => $body,
            Command::Rreplay($cmd) => $body,
        }
    };
}

impl Command {
    pub fn name(&self) -> &'static str {
        for_each_command!(self, cmd => cmd.name())
    }

    pub fn flags(&self) -> CommandFlags {
        for_each_command!(self, cmd => cmd.flags())
    }

    /// The full argv (name plus arguments), used when re-serializing the
    /// command for propagation.
    pub fn argv(&self) -> Vec<Bytes> {
        let mut argv = vec![Bytes::copy_from_slice(self.name().to_uppercase().as_bytes())];
        argv.extend(for_each_command!(self, cmd => cmd.to_resp_args()));
        argv
    }

    pub async fn execute(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        for_each_command!(self, cmd => cmd.execute(ctx).await)
    }
}
