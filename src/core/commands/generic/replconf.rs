// src/core/commands/generic/replconf.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::extract_string;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

/// `REPLCONF <option> <value> ...` as sent by a follower before SYNC/PSYNC.
/// Interpretation happens in the connection layer, which owns the session
/// the options describe.
#[derive(Debug, Clone, Default)]
pub struct Replconf {
    pub args: Vec<String>,
}

impl ParseCommand for Replconf {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        if args.is_empty() {
            return Err(KunziteError::WrongArgumentCount("REPLCONF".to_string()));
        }
        let str_args = args
            .iter()
            .map(extract_string)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Replconf { args: str_args })
    }
}

#[async_trait]
impl ExecutableCommand for Replconf {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::Internal(
            "REPLCONF is handled by the connection layer".into(),
        ))
    }
}

impl CommandSpec for Replconf {
    fn name(&self) -> &'static str {
        "replconf"
    }
    fn arity(&self) -> i64 {
        -1
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::ADMIN | CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        self.args.iter().map(|s| Bytes::from(s.clone())).collect()
    }
}
