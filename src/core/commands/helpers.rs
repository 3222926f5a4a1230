// src/core/commands/helpers.rs

//! Parsing helpers shared by the command structs.

use crate::core::KunziteError;
use crate::core::protocol::RespFrame;
use bytes::Bytes;

/// Extracts a `String` from a `RespFrame::BulkString`.
pub fn extract_string(frame: &RespFrame) -> Result<String, KunziteError> {
    if let RespFrame::BulkString(bs) = frame {
        String::from_utf8(bs.to_vec()).map_err(|_| KunziteError::WrongType)
    } else {
        Err(KunziteError::WrongType)
    }
}

/// Extracts raw `Bytes` from a `RespFrame::BulkString`.
pub fn extract_bytes(frame: &RespFrame) -> Result<Bytes, KunziteError> {
    match frame {
        RespFrame::BulkString(bs) => Ok(bs.clone()),
        _ => Err(KunziteError::WrongType),
    }
}

/// Validates that the number of arguments matches an exact expected count.
pub fn validate_arg_count(
    args: &[RespFrame],
    expected: usize,
    cmd: &str,
) -> Result<(), KunziteError> {
    if args.len() != expected {
        Err(KunziteError::WrongArgumentCount(cmd.to_string()))
    } else {
        Ok(())
    }
}
