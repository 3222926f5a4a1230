// src/core/commands/generic/wait.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::{extract_string, validate_arg_count};
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

/// `WAIT <numreplicas> <timeout-ms>`: blocks until enough followers
/// acknowledged the session's last write offset. The blocking happens in the
/// connection layer, which owns the session's write offset.
#[derive(Debug, Clone, Default)]
pub struct Wait {
    pub num_replicas: usize,
    pub timeout_ms: u64,
}

impl ParseCommand for Wait {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        validate_arg_count(args, 2, "WAIT")?;
        let num_replicas = extract_string(&args[0])?
            .parse::<usize>()
            .map_err(|_| KunziteError::NotAnInteger)?;
        let timeout_ms = extract_string(&args[1])?
            .parse::<u64>()
            .map_err(|_| KunziteError::NotAnInteger)?;
        Ok(Wait {
            num_replicas,
            timeout_ms,
        })
    }
}

#[async_trait]
impl ExecutableCommand for Wait {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::Internal(
            "WAIT is handled by the connection layer".into(),
        ))
    }
}

impl CommandSpec for Wait {
    fn name(&self) -> &'static str {
        "wait"
    }
    fn arity(&self) -> i64 {
        3
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(self.num_replicas.to_string()),
            Bytes::from(self.timeout_ms.to_string()),
        ]
    }
}
