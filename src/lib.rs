//! admbridge - Live sample and control bridge for multichannel audio export
//!
//! Producer plugin instances stream interleaved samples and answer control
//! commands over local sockets. An export coordinator connects to each of
//! them, keeps their streams in lockstep and writes one multichannel file.

pub mod export;
pub mod network;
pub mod protocol;

pub use export::{ExportAggregator, ExportConfig, ExportReport};
pub use network::{Communicator, CommunicatorRegistry, PortPair, ProducerKind, TransportConfig};
pub use protocol::{Command, ConfigReport};
