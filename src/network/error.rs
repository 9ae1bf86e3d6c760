//! Network error types

use thiserror::Error;

use crate::protocol::ProtocolError;

use super::communicator::{PortPair, ProducerKind};

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Command timed out waiting for a reply")]
    CommandTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Send buffer full")]
    SendBufferFull,

    #[error("No free port in range {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Message of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Sample block of {0} bytes is not a whole number of samples")]
    MisalignedBlock(usize),

    #[error("No frame available to copy")]
    FrameNotReady,

    #[error("Destination holds {actual} samples, frame needs {needed}")]
    DestinationTooSmall { needed: usize, actual: usize },

    #[error("Ports {ports} already belong to a {existing:?} producer, not {requested:?}")]
    ProducerKindMismatch {
        ports: PortPair,
        existing: ProducerKind,
        requested: ProducerKind,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
