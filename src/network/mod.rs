//! Network module for producer/coordinator communication
//!
//! Handles the local stream transport, sample block decoding, communicators
//! and their registry, and the producer-side endpoints.

mod communicator;
mod error;
mod framing;
mod message;
mod producer;
mod registry;
mod runtime;
mod transport;

pub use communicator::{Communicator, PortPair, ProducerKind};
pub use error::NetworkError;
pub use framing::{read_message, write_message, LENGTH_PREFIX_SIZE};
pub use message::{MessageBuffer, SampleBlock, SAMPLE_SIZE};
pub use producer::{ProducerEndpoint, StaticProducer};
pub use registry::CommunicatorRegistry;
pub use runtime::TransportRuntime;
pub use transport::{
    CommandHandler, CommandRequester, CommandResponder, SampleReceiver, SampleSender,
    TransportConfig,
};
