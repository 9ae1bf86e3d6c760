//! One logical connection to one producer
//!
//! A `Communicator` pairs a command requester with a sample receiver, learns
//! the producer's stream format, and hands out decoded frames one at a time.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::{
    ChannelMapping, ChannelTable, Command, CommandRequest, ConfigReport, MetadataExchange,
};

use super::error::NetworkError;
use super::message::SampleBlock;
use super::transport::{CommandRequester, SampleReceiver, TransportConfig};

/// The (sample port, command port) pair addressing one producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub samples: u16,
    pub command: u16,
}

impl PortPair {
    pub fn new(samples: u16, command: u16) -> Self {
        Self { samples, command }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "samples:{}/command:{}", self.samples, self.command)
    }
}

/// What a producer streams and how its frames are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProducerKind {
    /// One stem; every reported channel is copied
    ExportSource,
    /// Fixed 64-slot frames; only mapped slots are copied
    Scene,
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerKind::ExportSource => write!(f, "export-source"),
            ProducerKind::Scene => write!(f, "scene"),
        }
    }
}

/// What the producer last told us about itself
#[derive(Debug, Clone, Default)]
struct ProducerInfo {
    config: ConfigReport,
    mappings: Vec<ChannelMapping>,
    document: String,
}

/// Connection to one producer
pub struct Communicator {
    ports: PortPair,
    kind: ProducerKind,
    command: CommandRequester,
    samples: SampleReceiver,
    receive_timeout: Duration,
    info: RwLock<ProducerInfo>,
    rendering: Mutex<bool>,
    /// Block currently being drained
    current: Mutex<Option<SampleBlock>>,
    frames_copied: AtomicU64,
    /// The producer closed its sample stream
    stream_ended: AtomicBool,
}

impl Communicator {
    /// Dial both endpoints of a producer and fetch its stream info
    ///
    /// Any failure here is fatal: no half-connected communicator is returned.
    pub fn connect(
        ports: PortPair,
        kind: ProducerKind,
        config: &TransportConfig,
    ) -> Result<Self, NetworkError> {
        let command = CommandRequester::dial(ports.command, config)?;
        let samples = SampleReceiver::dial(ports.samples, config)?;

        let communicator = Self {
            ports,
            kind,
            command,
            samples,
            receive_timeout: config.receive_timeout(),
            info: RwLock::new(ProducerInfo::default()),
            rendering: Mutex::new(false),
            current: Mutex::new(None),
            frames_copied: AtomicU64::new(0),
            stream_ended: AtomicBool::new(false),
        };
        communicator.refresh_info()?;

        info!(
            "Connected to {} producer at {} ({} channels @ {} Hz)",
            kind,
            ports,
            communicator.channel_count(),
            communicator.sample_rate()
        );
        Ok(communicator)
    }

    /// Ask the producer for its config (and, for scenes, its channel table)
    pub fn refresh_info(&self) -> Result<(), NetworkError> {
        let config = self
            .command
            .do_command(&CommandRequest::GetConfig)?
            .into_config(Command::GetConfig)?;

        let (mappings, document) = match self.kind {
            ProducerKind::ExportSource => (Vec::new(), String::new()),
            ProducerKind::Scene => {
                let exchange = self
                    .command
                    .do_command(&CommandRequest::GetAdmAndMappings)?
                    .into_metadata(Command::GetAdmAndMappings)?;
                (
                    ChannelMapping::from_table(&exchange.table, config.channels as usize),
                    exchange.document,
                )
            }
        };

        debug!(
            "Producer {} reports {:?} with {} mappings",
            self.ports,
            config,
            mappings.len()
        );

        *self.info.write() = ProducerInfo {
            config,
            mappings,
            document,
        };
        Ok(())
    }

    pub fn ports(&self) -> PortPair {
        self.ports
    }

    pub fn kind(&self) -> ProducerKind {
        self.kind
    }

    pub fn config(&self) -> ConfigReport {
        self.info.read().config
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.read().config.sample_rate
    }

    /// Channels this communicator contributes to an exported frame
    pub fn channel_count(&self) -> usize {
        let info = self.info.read();
        match self.kind {
            ProducerKind::ExportSource => info.config.channels as usize,
            ProducerKind::Scene => info.mappings.len(),
        }
    }

    /// Samples per frame on the wire
    fn frame_width(&self) -> usize {
        self.info.read().config.channels as usize
    }

    pub fn channel_mappings(&self) -> Vec<ChannelMapping> {
        self.info.read().mappings.clone()
    }

    pub fn metadata_document(&self) -> String {
        self.info.read().document.clone()
    }

    pub fn is_rendering(&self) -> bool {
        *self.rendering.lock()
    }

    /// Frames handed out so far
    pub fn frames_copied(&self) -> u64 {
        self.frames_copied.load(Ordering::Relaxed)
    }

    /// Drive the rendering state; only a change reaches the producer
    pub fn set_rendering_state(&self, state: bool) -> Result<(), NetworkError> {
        let mut rendering = self.rendering.lock();
        if *rendering == state {
            return Ok(());
        }

        self.command.do_command(&CommandRequest::render(state))?;
        *rendering = state;

        info!(
            "Producer {} {}",
            self.ports,
            if state { "rendering" } else { "idle" }
        );
        Ok(())
    }

    /// Push a channel table and metadata document to the producer
    pub fn send_metadata(
        &self,
        document: impl Into<String>,
        table: ChannelTable,
    ) -> Result<(), NetworkError> {
        let request = CommandRequest::SetAdmAndMappings(MetadataExchange::new(table, document));
        self.command.do_command(&request)?;
        Ok(())
    }

    /// Whether a whole frame can be copied now
    ///
    /// Waits at most the receive timeout for a new block. "Nothing yet" is
    /// `Ok(false)`, and so is a producer that has closed its stream once every
    /// block it delivered has been consumed. Only transport and protocol faults
    /// are errors.
    pub fn next_frame_available(&self) -> Result<bool, NetworkError> {
        if self.channel_count() == 0 {
            return Ok(false);
        }
        let width = self.frame_width();
        let sample_rate = self.sample_rate();

        let mut current = self.current.lock();
        if let Some(block) = current.as_ref() {
            if block.remaining() >= width {
                return Ok(true);
            }
            if !block.at_seq_read_end() {
                warn!(
                    "Discarding {} trailing samples from {} (not a whole frame)",
                    block.remaining(),
                    self.ports
                );
            }
            *current = None;
        }

        // Only the first receive waits; unusable blocks are skipped without delay
        let mut wait = self.receive_timeout;
        loop {
            let message = match self.samples.receive_block(wait) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(false),
                Err(NetworkError::Disconnected) => {
                    if !self.stream_ended.swap(true, Ordering::Relaxed) {
                        info!("Producer {} closed its sample stream", self.ports);
                    }
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

            let block = SampleBlock::from_message(message)?.with_format(width, sample_rate);
            if block.remaining() >= width {
                *current = Some(block);
                return Ok(true);
            }
            if !block.at_seq_read_end() {
                warn!(
                    "Dropping {}-sample block from {} (frame is {} samples)",
                    block.remaining(),
                    self.ports,
                    width
                );
            }
            wait = Duration::ZERO;
        }
    }

    /// The producer closed its sample stream and no whole frame is left
    pub fn is_stream_ended(&self) -> bool {
        if !self.stream_ended.load(Ordering::Relaxed) {
            return false;
        }
        let width = self.frame_width();
        self.current
            .lock()
            .as_ref()
            .map_or(true, |block| width == 0 || block.remaining() < width)
    }

    /// Copy one frame into `dst` and advance past it
    ///
    /// `dst` receives `channel_count()` samples. Unless `bypass_check` is set by
    /// a caller that has already seen `next_frame_available()` return true,
    /// availability is checked first; calling this without a frame is an error.
    pub fn copy_next_frame(
        &self,
        dst: &mut [f32],
        bypass_check: bool,
    ) -> Result<(), NetworkError> {
        if !bypass_check && !self.next_frame_available()? {
            return Err(NetworkError::FrameNotReady);
        }

        let info = self.info.read();
        let width = info.config.channels as usize;
        let needed = match self.kind {
            ProducerKind::ExportSource => width,
            ProducerKind::Scene => info.mappings.len(),
        };
        if dst.len() < needed {
            return Err(NetworkError::DestinationTooSmall {
                needed,
                actual: dst.len(),
            });
        }

        let mut current = self.current.lock();
        let block = match current.as_mut() {
            Some(block) if needed > 0 && block.remaining() >= width => block,
            _ => return Err(NetworkError::FrameNotReady),
        };

        match self.kind {
            ProducerKind::ExportSource => {
                block.seq_read_and_put(&mut dst[..width]);
            }
            ProducerKind::Scene => {
                let frame_start = block.seq_read_pos();
                for mapping in &info.mappings {
                    let slot = frame_start + mapping.input_channel as usize;
                    block.advance_seq_read_pos(slot - block.seq_read_pos());
                    let out = mapping.output_channel as usize;
                    block.seq_read_and_put(&mut dst[out..=out]);
                }
                block.advance_seq_read_pos(frame_start + width - block.seq_read_pos());
            }
        }

        self.frames_copied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop rendering if needed, then release both endpoints. Idempotent.
    pub fn close(&self) {
        if self.command.is_open() {
            if let Err(e) = self.set_rendering_state(false) {
                warn!(
                    "Failed to stop rendering on {} before close: {}",
                    self.ports, e
                );
            }
        }
        self.command.close();
        self.samples.close();
        *self.current.lock() = None;
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("ports", &self.ports)
            .field("kind", &self.kind)
            .field("rendering", &self.is_rendering())
            .finish()
    }
}
