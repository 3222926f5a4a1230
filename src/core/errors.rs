// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
#[derive(Error, Debug)]
pub enum KunziteError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Syntax error")]
    SyntaxError,

    #[error("Wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("NOAUTH Authentication required")]
    AuthRequired,

    #[error("WRONGPASS invalid password")]
    InvalidPassword,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("READONLY {0}")]
    ReadOnly(String),

    #[error("Replication Error: {0}")]
    ReplicationError(String),

    #[error("NOMASTERLINK Can't SYNC while not connected with my master")]
    NoMasterLink,

    #[error("LOADING server is loading the dataset in memory")]
    Loading,

    #[error("Snapshot Error: {0}")]
    SnapshotError(String),

    #[error("Persistence Error: {0}")]
    AofError(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual Clone because `std::io::Error` is not cloneable; the Arc makes it cheap.
impl Clone for KunziteError {
    fn clone(&self) -> Self {
        match self {
            KunziteError::Io(e) => KunziteError::Io(Arc::clone(e)),
            KunziteError::IncompleteData => KunziteError::IncompleteData,
            KunziteError::UnknownCommand(s) => KunziteError::UnknownCommand(s.clone()),
            KunziteError::SyntaxError => KunziteError::SyntaxError,
            KunziteError::WrongArgumentCount(s) => KunziteError::WrongArgumentCount(s.clone()),
            KunziteError::WrongType => KunziteError::WrongType,
            KunziteError::NotAnInteger => KunziteError::NotAnInteger,
            KunziteError::AuthRequired => KunziteError::AuthRequired,
            KunziteError::InvalidPassword => KunziteError::InvalidPassword,
            KunziteError::InvalidRequest(s) => KunziteError::InvalidRequest(s.clone()),
            KunziteError::InvalidState(s) => KunziteError::InvalidState(s.clone()),
            KunziteError::ReadOnly(s) => KunziteError::ReadOnly(s.clone()),
            KunziteError::ReplicationError(s) => KunziteError::ReplicationError(s.clone()),
            KunziteError::NoMasterLink => KunziteError::NoMasterLink,
            KunziteError::Loading => KunziteError::Loading,
            KunziteError::SnapshotError(s) => KunziteError::SnapshotError(s.clone()),
            KunziteError::AofError(s) => KunziteError::AofError(s.clone()),
            KunziteError::Internal(s) => KunziteError::Internal(s.clone()),
        }
    }
}

impl PartialEq for KunziteError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KunziteError::Io(e1), KunziteError::Io(e2)) => e1.to_string() == e2.to_string(),
            (KunziteError::UnknownCommand(s1), KunziteError::UnknownCommand(s2)) => s1 == s2,
            (KunziteError::WrongArgumentCount(s1), KunziteError::WrongArgumentCount(s2)) => {
                s1 == s2
            }
            (KunziteError::InvalidRequest(s1), KunziteError::InvalidRequest(s2)) => s1 == s2,
            (KunziteError::InvalidState(s1), KunziteError::InvalidState(s2)) => s1 == s2,
            (KunziteError::ReadOnly(s1), KunziteError::ReadOnly(s2)) => s1 == s2,
            (KunziteError::ReplicationError(s1), KunziteError::ReplicationError(s2)) => s1 == s2,
            (KunziteError::SnapshotError(s1), KunziteError::SnapshotError(s2)) => s1 == s2,
            (KunziteError::AofError(s1), KunziteError::AofError(s2)) => s1 == s2,
            (KunziteError::Internal(s1), KunziteError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for KunziteError {
    fn from(e: std::io::Error) -> Self {
        KunziteError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for KunziteError {
    fn from(e: uuid::Error) -> Self {
        KunziteError::InvalidRequest(format!("Invalid UUID: {e}"))
    }
}

impl From<std::str::Utf8Error> for KunziteError {
    fn from(_: std::str::Utf8Error) -> Self {
        KunziteError::WrongType
    }
}

impl From<std::string::FromUtf8Error> for KunziteError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        KunziteError::WrongType
    }
}

impl From<ParseIntError> for KunziteError {
    fn from(_: ParseIntError) -> Self {
        KunziteError::NotAnInteger
    }
}
