// src/core/commands/generic/info.rs

//! Implements `INFO [section]`, restricted to the sections this server
//! actually has: `server` and `replication`.

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::extract_string;
use crate::core::protocol::RespFrame;
use crate::core::state::{FollowerSyncState, LinkState};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default)]
pub struct Info {
    pub section: Option<String>,
}

impl ParseCommand for Info {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        match args.len() {
            0 => Ok(Info { section: None }),
            1 => Ok(Info {
                section: Some(extract_string(&args[0])?.to_ascii_lowercase()),
            }),
            _ => Err(KunziteError::WrongArgumentCount("INFO".to_string())),
        }
    }
}

#[async_trait]
impl ExecutableCommand for Info {
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        let mut out = String::new();
        let want = |name: &str| match &self.section {
            Some(section) => section == name,
            None => true,
        };

        if want("server") {
            let _ = writeln!(out, "# Server");
            let _ = writeln!(out, "kunzitedb_version:{}", env!("CARGO_PKG_VERSION"));
            let _ = writeln!(out, "run_uuid:{}", ctx.state.instance_uuid);
            let _ = writeln!(out);
        }

        if want("replication") {
            let replication = &ctx.state.replication;
            let leaders = replication.leaders.lock().clone();
            let _ = writeln!(out, "# Replication");
            let role = if leaders.is_empty() {
                "master"
            } else if replication.settings.active_replica {
                "active-replica"
            } else {
                "slave"
            };
            let _ = writeln!(out, "role:{role}");

            for link in &leaders {
                let status = if link.link_state() == LinkState::Connected {
                    "up"
                } else {
                    "down"
                };
                let _ = writeln!(out, "master_host:{}", link.host);
                let _ = writeln!(out, "master_port:{}", link.port);
                let _ = writeln!(out, "master_link_status:{status}");
                let _ = writeln!(out, "slave_repl_offset:{}", link.reploff());
            }

            let core = replication.core.lock();
            let online: Vec<_> = core
                .followers
                .values()
                .filter(|f| f.state == FollowerSyncState::Online)
                .collect();
            let _ = writeln!(out, "connected_slaves:{}", online.len());
            for (i, follower) in online.iter().enumerate() {
                let ip = follower
                    .announced_ip
                    .clone()
                    .unwrap_or_else(|| follower.addr.ip().to_string());
                let port = follower
                    .listening_port
                    .unwrap_or_else(|| follower.addr.port());
                let lag = follower.ack_time.elapsed().as_secs();
                let _ = writeln!(
                    out,
                    "slave{i}:ip={ip},port={port},state=online,offset={},lag={lag}",
                    follower.effective_ack()
                );
            }
            let _ = writeln!(out, "master_replid:{}", core.identity.primary_id);
            let _ = writeln!(out, "master_replid2:{}", core.identity.secondary_id);
            let _ = writeln!(out, "master_repl_offset:{}", core.master_repl_offset);
            let _ = writeln!(
                out,
                "second_repl_offset:{}",
                core.identity.secondary_valid_until_offset
            );
            match &core.backlog {
                Some(backlog) => {
                    let _ = writeln!(out, "repl_backlog_active:1");
                    let _ = writeln!(out, "repl_backlog_size:{}", backlog.capacity());
                    let _ = writeln!(
                        out,
                        "repl_backlog_first_byte_offset:{}",
                        backlog.first_valid_offset()
                    );
                    let _ = writeln!(out, "repl_backlog_histlen:{}", backlog.history_len());
                }
                None => {
                    let _ = writeln!(out, "repl_backlog_active:0");
                }
            }
        }

        Ok((
            RespFrame::BulkString(Bytes::from(out)),
            WriteOutcome::DidNotWrite,
        ))
    }
}

impl CommandSpec for Info {
    fn name(&self) -> &'static str {
        "info"
    }
    fn arity(&self) -> i64 {
        -1
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::READONLY | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        self.section
            .iter()
            .map(|s| Bytes::from(s.clone()))
            .collect()
    }
}
