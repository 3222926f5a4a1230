// src/core/commands/generic/auth.rs

use crate::core::KunziteError;
use crate::core::commands::command_trait::{
    CommandFlags, CommandSpec, ExecutableCommand, ExecutionContext, ParseCommand, WriteOutcome,
};
use crate::core::commands::helpers::extract_string;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub user: Option<String>,
    pub secret: String,
}

impl ParseCommand for Auth {
    fn parse(args: &[RespFrame]) -> Result<Self, KunziteError> {
        match args.len() {
            1 => Ok(Auth {
                user: None,
                secret: extract_string(&args[0])?,
            }),
            2 => Ok(Auth {
                user: Some(extract_string(&args[0])?),
                secret: extract_string(&args[1])?,
            }),
            _ => Err(KunziteError::WrongArgumentCount("AUTH".to_string())),
        }
    }
}

#[async_trait]
impl ExecutableCommand for Auth {
    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
    ) -> Result<(RespFrame, WriteOutcome), KunziteError> {
        Err(KunziteError::Internal(
            "AUTH is handled by the connection layer".into(),
        ))
    }
}

impl CommandSpec for Auth {
    fn name(&self) -> &'static str {
        "auth"
    }
    fn arity(&self) -> i64 {
        -2
    }
    fn flags(&self) -> CommandFlags {
        CommandFlags::CONNECTION | CommandFlags::NO_PROPAGATE
    }
    fn to_resp_args(&self) -> Vec<Bytes> {
        let mut args = Vec::new();
        if let Some(user) = &self.user {
            args.push(Bytes::from(user.clone()));
        }
        args.push(Bytes::from(self.secret.clone()));
        args
    }
}
