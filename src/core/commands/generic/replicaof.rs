// src/core/commands/generic/replicaof.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::{extract_string, validate_arg_count};
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

/// `REPLICAOF <host> <port>` or `REPLICAOF NO ONE`.
#[derive(Debug, Clone, Default)]
pub struct ReplicaOf {
    pub host: String,
    pub port: String,
}

impl ReplicaOf {
    /// True for the special host/port pair that promotes this instance.
    pub fn is_no_one(&self) -> bool {
        self.host.eq_ignore_ascii_case("no") && self.port.eq_ignore_ascii_case("one")
    }
}

impl ParseCommand for ReplicaOf {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        validate_arg_count(args, 2, "REPLICAOF")?;
        Ok(ReplicaOf {
            host: extract_string(&args[0])?,
            port: extract_string(&args[1])?,
        })
    }
}

#[async_trait]
impl ExecutableCommand for ReplicaOf {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::Internal(
            "REPLICAOF is handled by the connection layer".into(),
        ))
    }
}

impl CommandSpec for ReplicaOf {
    fn name(&self) -> &'static str {
        "replicaof"
    }
    fn arity(&self) -> i64 {
        3
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::ADMIN | CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(self.host.clone()),
            Bytes::from(self.port.clone()),
        ]
    }
}
