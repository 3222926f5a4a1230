// src/core/commands/generic/role.rs

//! Implements the `ROLE` command: the instance's place in the replication
//! topology and its synchronization progress.

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::validate_arg_count;
use crate::core::protocol::RespFrame;
use crate::core::state::FollowerSyncState;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct Role;

impl ParseCommand for Role {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        validate_arg_count(args, 0, "ROLE")?;
        Ok(Role)
    }
}

#[async_trait]
impl ExecutableCommand for Role {
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        let replication = &ctx.state.replication;
        let leaders = replication.leaders.lock().clone();

        let reply = if let Some(link) = leaders.first() {
            // Follower (or active replica): report the first upstream link.
            let role = if replication.settings.active_replica {
                "active-replica"
            } else {
                "slave"
            };
            let offset = match link.master_initial_offset.load(std::sync::atomic::Ordering::SeqCst)
            {
                -1 => -1,
                _ => link.reploff() as i64,
            };
            RespFrame::Array(vec![
                RespFrame::BulkString(Bytes::from_static(role.as_bytes())),
                RespFrame::BulkString(Bytes::from(link.host.clone())),
                RespFrame::Integer(link.port as i64),
                RespFrame::BulkString(Bytes::from(link.link_state().as_str())),
                RespFrame::Integer(offset),
            ])
        } else {
            let core = replication.core.lock();
            let mut followers = Vec::new();
            for follower in core.followers.values() {
                if follower.state != FollowerSyncState::Online {
                    continue;
                }
                let ip = follower
                    .announced_ip
                    .clone()
                    .unwrap_or_else(|| follower.addr.ip().to_string());
                let port = follower
                    .listening_port
                    .unwrap_or_else(|| follower.addr.port());
                followers.push(RespFrame::Array(vec![
                    RespFrame::BulkString(Bytes::from(ip)),
                    RespFrame::BulkString(Bytes::from(port.to_string())),
                    RespFrame::BulkString(Bytes::from(follower.effective_ack().to_string())),
                ]));
            }
            RespFrame::Array(vec![
                RespFrame::BulkString(Bytes::from_static(b"master")),
                RespFrame::Integer(core.master_repl_offset as i64),
                RespFrame::Array(followers),
            ])
        };

        Ok((reply, WriteOutcome::DidNotWrite))
    }
}

impl CommandSpec for Role {
    fn name(&self) -> &'static str {
        "role"
    }
    fn arity(&self) -> i64 {
        1
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::READONLY | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        vec![]
    }
}
