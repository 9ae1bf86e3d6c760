//! Plugin-side endpoints
//!
//! A producer listens on a sample port and a command port, reports both so a
//! coordinator can dial them, and streams blocks from its audio thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::protocol::{
    ChannelTable, Command, CommandReply, CommandRequest, ConfigReport, MetadataExchange,
    ProtocolError, MAX_CHANNEL_SLOTS,
};

use super::communicator::{PortPair, ProducerKind};
use super::error::NetworkError;
use super::message::SampleBlock;
use super::transport::{CommandHandler, CommandResponder, SampleSender, TransportConfig};

/// Listening endpoint pair owned by one producer
pub struct ProducerEndpoint {
    samples: SampleSender,
    command: CommandResponder,
}

impl ProducerEndpoint {
    pub fn listen(
        handler: Arc<dyn CommandHandler>,
        config: &TransportConfig,
    ) -> Result<Self, NetworkError> {
        let samples = SampleSender::listen(config)?;
        let command = CommandResponder::listen(handler, config)?;

        info!(
            "Producer listening (samples port {}, command port {})",
            samples.port(),
            command.port()
        );
        Ok(Self { samples, command })
    }

    pub fn samples_port(&self) -> u16 {
        self.samples.port()
    }

    pub fn command_port(&self) -> u16 {
        self.command.port()
    }

    pub fn ports(&self) -> PortPair {
        PortPair::new(self.samples_port(), self.command_port())
    }

    /// Queue interleaved samples for delivery
    ///
    /// Never blocks; fails if no coordinator is connected or the queue is full.
    pub fn send_block(&self, samples: &[f32]) -> Result<(), NetworkError> {
        let body = SampleBlock::from_samples(samples).into_message().into_vec();
        self.samples.send_block(body)
    }

    pub fn is_peer_connected(&self) -> bool {
        self.samples.is_peer_connected()
    }

    pub fn wait_for_peer(&self, timeout: Duration) -> bool {
        self.samples.wait_for_peer(timeout)
    }

    pub fn blocks_sent(&self) -> u64 {
        self.samples.blocks_sent()
    }

    pub fn close(&self) {
        self.samples.close();
        self.command.close();
    }
}

/// Command handler for a producer with a fixed stream format
///
/// An export source answers every opcode-only command with its config report.
/// A scene reports 64 slots, acks render changes and serves its metadata.
pub struct StaticProducer {
    kind: ProducerKind,
    config: ConfigReport,
    metadata: Mutex<MetadataExchange>,
    rendering: AtomicBool,
    render_requests: AtomicU64,
}

impl StaticProducer {
    pub fn export_source(channels: u8, sample_rate: u32) -> Self {
        Self {
            kind: ProducerKind::ExportSource,
            config: ConfigReport {
                channels,
                sample_rate,
                ..Default::default()
            },
            metadata: Mutex::new(MetadataExchange::default()),
            rendering: AtomicBool::new(false),
            render_requests: AtomicU64::new(0),
        }
    }

    pub fn scene(sample_rate: u32, table: ChannelTable, document: impl Into<String>) -> Self {
        Self {
            kind: ProducerKind::Scene,
            config: ConfigReport {
                channels: MAX_CHANNEL_SLOTS as u8,
                sample_rate,
                ..Default::default()
            },
            metadata: Mutex::new(MetadataExchange::new(table, document)),
            rendering: AtomicBool::new(false),
            render_requests: AtomicU64::new(0),
        }
    }

    /// Set the essence type identifiers carried in the config report
    pub fn with_formats(
        mut self,
        type_definition: u16,
        pack_format_id: u16,
        channel_format_id: u16,
    ) -> Self {
        self.config.type_definition = type_definition;
        self.config.pack_format_id = pack_format_id;
        self.config.channel_format_id = channel_format_id;
        self
    }

    pub fn kind(&self) -> ProducerKind {
        self.kind
    }

    pub fn config(&self) -> ConfigReport {
        self.config
    }

    /// Frame width on the wire
    pub fn frame_width(&self) -> usize {
        self.config.channels as usize
    }

    pub fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::Acquire)
    }

    /// Render state changes received
    pub fn render_requests(&self) -> u64 {
        self.render_requests.load(Ordering::Relaxed)
    }

    pub fn metadata(&self) -> MetadataExchange {
        self.metadata.lock().clone()
    }

    fn set_rendering(&self, state: bool) {
        self.rendering.store(state, Ordering::Release);
        self.render_requests.fetch_add(1, Ordering::Relaxed);
        info!(
            "{} producer {}",
            self.kind,
            if state { "started rendering" } else { "stopped rendering" }
        );
    }
}

impl CommandHandler for StaticProducer {
    fn handle(&self, request: CommandRequest) -> Result<CommandReply, ProtocolError> {
        match (self.kind, request) {
            (ProducerKind::ExportSource, CommandRequest::GetAdmAndMappings) => {
                Err(ProtocolError::Unsupported(Command::GetAdmAndMappings))
            }
            (ProducerKind::ExportSource, CommandRequest::SetAdmAndMappings(_)) => {
                Err(ProtocolError::Unsupported(Command::SetAdmAndMappings))
            }
            (ProducerKind::ExportSource, request) => {
                match request {
                    CommandRequest::StartRender => self.set_rendering(true),
                    CommandRequest::StopRender => self.set_rendering(false),
                    _ => {}
                }
                Ok(CommandReply::Config(self.config))
            }
            (ProducerKind::Scene, CommandRequest::GetConfig) => {
                Ok(CommandReply::Config(self.config))
            }
            (ProducerKind::Scene, CommandRequest::StartRender) => {
                self.set_rendering(true);
                Ok(CommandReply::ack(Command::StartRender))
            }
            (ProducerKind::Scene, CommandRequest::StopRender) => {
                self.set_rendering(false);
                Ok(CommandReply::ack(Command::StopRender))
            }
            (ProducerKind::Scene, CommandRequest::GetAdmAndMappings) => {
                Ok(CommandReply::Metadata(self.metadata()))
            }
            (ProducerKind::Scene, CommandRequest::SetAdmAndMappings(exchange)) => {
                *self.metadata.lock() = exchange;
                Ok(CommandReply::ack(Command::SetAdmAndMappings))
            }
        }
    }
}
