// src/core/commands/generic/sync.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::validate_arg_count;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

/// Legacy `SYNC`: always a full transfer, no partial resynchronization.
#[derive(Debug, Clone, Default)]
pub struct SyncCmd;

impl ParseCommand for SyncCmd {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        validate_arg_count(args, 0, "SYNC")?;
        Ok(SyncCmd)
    }
}

#[async_trait]
impl ExecutableCommand for SyncCmd {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::Internal(
            "SYNC command should not be executed directly".into(),
        ))
    }
}

impl CommandSpec for SyncCmd {
    fn name(&self) -> &'static str {
        "sync"
    }
    fn arity(&self) -> i64 {
        1
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::ADMIN | CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        vec![]
    }
}
