// src/core/commands/generic/rreplay.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::extract_bytes;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

/// `RREPLAY <origin-uuid> <cmd-bytes> [<db>] [<mvcc>]`, the active-replica
/// propagation envelope. Only a leader link may deliver it; the follower
/// worker unwraps and applies it there. Arriving on a normal client
/// connection it is rejected.
#[derive(Debug, Clone, Default)]
pub struct Rreplay {
    pub args: Vec<Bytes>,
}

impl ParseCommand for Rreplay {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        if args.len() < 2 || args.len() > 4 {
            return Err(KunziteError::WrongArgumentCount("RREPLAY".to_string()));
        }
        let args = args.iter().map(extract_bytes).collect::<Result<_, _>>()?;
        Ok(Rreplay { args })
    }
}

#[async_trait]
impl ExecutableCommand for Rreplay {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::InvalidState(
            "RREPLAY must be sent from a leader".into(),
        ))
    }
}

impl CommandSpec for Rreplay {
    fn name(&self) -> &'static str {
        "rreplay"
    }
    fn arity(&self) -> i64 {
        -3
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::WRITE | CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        self.args.clone()
    }
}
