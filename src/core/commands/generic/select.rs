// src/core/commands/generic/select.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::{extract_string, validate_arg_count};
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct Select {
    pub db_index: usize,
}

impl ParseCommand for Select {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        validate_arg_count(args, 1, "SELECT")?;
        let db_index = extract_string(&args[0])?
            .parse::<usize>()
            .map_err(|_| KunziteError::NotAnInteger)?;
        Ok(Select { db_index })
    }
}

#[async_trait]
impl ExecutableCommand for Select {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::Internal(
            "SELECT is handled by the connection layer".into(),
        ))
    }
}

impl CommandSpec for Select {
    fn name(&self) -> &'static str {
        "select"
    }
    fn arity(&self) -> i64 {
        2
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        vec![Bytes::from(self.db_index.to_string())]
    }
}
