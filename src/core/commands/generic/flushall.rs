// src/core/commands/generic/flushall.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::validate_arg_count;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct FlushAll;

impl ParseCommand for FlushAll {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        validate_arg_count(args, 0, "FLUSHALL")?;
        Ok(FlushAll)
    }
}

#[async_trait]
impl ExecutableCommand for FlushAll {
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        for db in &ctx.state.dbs {
            db.clear();
        }
        Ok((RespFrame::ok(), WriteOutcome::Flush))
    }
}

impl CommandSpec for FlushAll {
    fn name(&self) -> &'static str {
        "flushall"
    }
    fn arity(&self) -> i64 {
        1
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::WRITE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        vec![]
    }
}
