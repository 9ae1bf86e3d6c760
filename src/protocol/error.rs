//! Protocol error types

use thiserror::Error;

use super::Command;

/// Malformed or unexpected command protocol payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty command message")]
    EmptyMessage,

    #[error("Unknown command opcode: {0:#04x}")]
    UnknownCommand(u8),

    #[error("{what} payload too short: expected at least {expected} bytes, got {actual}")]
    Undersized {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unexpected {actual}-byte reply to {command:?}")]
    WrongReplyLength { command: Command, actual: usize },

    #[error("Metadata document is not valid UTF-8")]
    InvalidDocument,

    #[error("Producer rejected {0:?}")]
    ProducerRejected(Command),

    #[error("{0:?} is not supported by this producer")]
    Unsupported(Command),
}
