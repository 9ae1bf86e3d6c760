//! Export error types

use thiserror::Error;

use crate::network::NetworkError;

use super::aggregator::AggregatorState;

/// Errors that can occur while aggregating and writing an export
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: AggregatorState,
    },

    #[error("Route to input channel {route} but the source has {channels} channels")]
    RouteOutOfRange { route: usize, channels: usize },

    #[error("Expected {expected} channels, got {actual}")]
    ChannelCountMismatch { expected: usize, actual: usize },

    #[error("Block has no channel layout")]
    UnknownChannelLayout,

    #[error("Output exceeds the WAV size limit")]
    FileTooLarge,

    #[error("Unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("Source {0} has no frame ready")]
    FrameNotReady(String),

    #[error("Sources out of alignment after a failed copy from {0}")]
    Misaligned(String),
}
