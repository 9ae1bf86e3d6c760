//! Command definitions for the admbridge control protocol
//!
//! Every request starts with a single opcode byte. Payload layouts:
//! - GetConfig / StartRender / StopRender / GetAdmAndMappings: opcode only
//! - SetAdmAndMappings: opcode + 256-byte channel table + UTF-8 document
//!
//! Replies carry no opcode:
//! - config report: 11 bytes (u8 channels, u32 sample rate, 3 x u16 type ids)
//! - ack: 1 byte (echoes the opcode, or `ERROR_REPLY`)
//! - metadata: 256-byte channel table + UTF-8 document
//!
//! All multi-byte integers are little-endian.

use serde::{Deserialize, Serialize};

use super::error::ProtocolError;

/// Number of channel slots a producer can expose
pub const MAX_CHANNEL_SLOTS: usize = 64;

/// Size of the channel-to-identifier table in bytes
pub const CHANNEL_TABLE_SIZE: usize = MAX_CHANNEL_SLOTS * 4;

/// Size of a config report in bytes
pub const CONFIG_REPORT_SIZE: usize = 11;

/// Single-byte reply sent when a producer cannot answer a request
pub const ERROR_REPLY: u8 = 0xFF;

/// Control operations
///
/// The numeric values are part of the wire contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    GetConfig = 0,
    StartRender = 1,
    StopRender = 2,
    GetAdmAndMappings = 3,
    SetAdmAndMappings = 4,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::GetConfig),
            1 => Ok(Command::StartRender),
            2 => Ok(Command::StopRender),
            3 => Ok(Command::GetAdmAndMappings),
            4 => Ok(Command::SetAdmAndMappings),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Stream format reported by a producer in response to `GetConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigReport {
    /// Number of samples per frame on the sample stream
    pub channels: u8,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Essence type definition
    pub type_definition: u16,
    /// Pack format identifier (lower 16 bits)
    pub pack_format_id: u16,
    /// Channel format identifier (lower 16 bits)
    pub channel_format_id: u16,
}

impl ConfigReport {
    /// Pack format identifier with the type definition in the upper 16 bits
    pub fn pack_format_id_full(&self) -> u32 {
        ((self.type_definition as u32) << 16) | self.pack_format_id as u32
    }

    /// Channel format identifier with the type definition in the upper 16 bits
    pub fn channel_format_id_full(&self) -> u32 {
        ((self.type_definition as u32) << 16) | self.channel_format_id as u32
    }

    /// Pack format label, e.g. `AP_00010002`
    pub fn pack_format_label(&self) -> String {
        format!("AP_{:08X}", self.pack_format_id_full())
    }

    /// Channel format label, e.g. `AC_00010003`
    pub fn channel_format_label(&self) -> String {
        format!("AC_{:08X}", self.channel_format_id_full())
    }

    pub fn to_bytes(&self) -> [u8; CONFIG_REPORT_SIZE] {
        let mut buf = [0u8; CONFIG_REPORT_SIZE];
        buf[0] = self.channels;
        buf[1..5].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[5..7].copy_from_slice(&self.type_definition.to_le_bytes());
        buf[7..9].copy_from_slice(&self.pack_format_id.to_le_bytes());
        buf[9..11].copy_from_slice(&self.channel_format_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < CONFIG_REPORT_SIZE {
            return Err(ProtocolError::Undersized {
                what: "config report",
                expected: CONFIG_REPORT_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            channels: data[0],
            sample_rate: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
            type_definition: u16::from_le_bytes([data[5], data[6]]),
            pack_format_id: u16::from_le_bytes([data[7], data[8]]),
            channel_format_id: u16::from_le_bytes([data[9], data[10]]),
        })
    }
}

/// Association between a produced channel slot and a written output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    /// Slot position in the producer's frame (0-based)
    pub input_channel: u8,
    /// Dense position in the exported frame (0-based)
    pub output_channel: u8,
    /// Opaque identifier correlating the channel to a metadata element
    pub identifier: u32,
}

impl ChannelMapping {
    /// Dense mappings for the populated slots below `channel_count`
    pub fn from_table(table: &ChannelTable, channel_count: usize) -> Vec<Self> {
        table.mappings(channel_count)
    }
}

/// Fixed 64-slot channel-to-identifier table; 0 marks an unused slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTable {
    slots: [u32; MAX_CHANNEL_SLOTS],
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            slots: [0; MAX_CHANNEL_SLOTS],
        }
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for a slot (0 if unused or out of range)
    pub fn get(&self, slot: usize) -> u32 {
        self.slots.get(slot).copied().unwrap_or(0)
    }

    /// Set the identifier for a slot. Returns false if the slot is out of range.
    pub fn set(&mut self, slot: usize, identifier: u32) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) => {
                *entry = identifier;
                true
            }
            None => false,
        }
    }

    /// Number of populated slots
    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|&&id| id != 0).count()
    }

    /// Build the dense mapping list for the first `channel_count` slots
    ///
    /// Output positions are assigned in input order, only to populated slots.
    pub fn mappings(&self, channel_count: usize) -> Vec<ChannelMapping> {
        self.slots
            .iter()
            .take(channel_count.min(MAX_CHANNEL_SLOTS))
            .enumerate()
            .filter(|(_, id)| **id != 0)
            .enumerate()
            .map(|(output, (input, &identifier))| ChannelMapping {
                input_channel: input as u8,
                output_channel: output as u8,
                identifier,
            })
            .collect()
    }

    pub fn to_bytes(&self) -> [u8; CHANNEL_TABLE_SIZE] {
        let mut buf = [0u8; CHANNEL_TABLE_SIZE];
        for (chunk, id) in buf.chunks_exact_mut(4).zip(self.slots.iter()) {
            chunk.copy_from_slice(&id.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < CHANNEL_TABLE_SIZE {
            return Err(ProtocolError::Undersized {
                what: "channel table",
                expected: CHANNEL_TABLE_SIZE,
                actual: data.len(),
            });
        }

        let mut table = Self::default();
        for (slot, chunk) in table
            .slots
            .iter_mut()
            .zip(data[..CHANNEL_TABLE_SIZE].chunks_exact(4))
        {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(table)
    }
}

/// Channel table plus metadata document, exchanged in both directions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataExchange {
    pub table: ChannelTable,
    pub document: String,
}

impl MetadataExchange {
    pub fn new(table: ChannelTable, document: impl Into<String>) -> Self {
        Self {
            table,
            document: document.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        CHANNEL_TABLE_SIZE + self.document.len()
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table.to_bytes());
        buf.extend_from_slice(self.document.as_bytes());
    }

    /// Decode table + document; the document length is whatever follows the table
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let table = ChannelTable::from_bytes(data)?;
        let document = std::str::from_utf8(&data[CHANNEL_TABLE_SIZE..])
            .map_err(|_| ProtocolError::InvalidDocument)?
            .to_owned();
        Ok(Self { table, document })
    }
}

/// A decoded control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    GetConfig,
    StartRender,
    StopRender,
    GetAdmAndMappings,
    SetAdmAndMappings(MetadataExchange),
}

impl CommandRequest {
    /// Request for a rendering state transition
    pub fn render(state: bool) -> Self {
        if state {
            CommandRequest::StartRender
        } else {
            CommandRequest::StopRender
        }
    }

    pub fn command(&self) -> Command {
        match self {
            CommandRequest::GetConfig => Command::GetConfig,
            CommandRequest::StartRender => Command::StartRender,
            CommandRequest::StopRender => Command::StopRender,
            CommandRequest::GetAdmAndMappings => Command::GetAdmAndMappings,
            CommandRequest::SetAdmAndMappings(_) => Command::SetAdmAndMappings,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CommandRequest::SetAdmAndMappings(exchange) => {
                let mut buf = Vec::with_capacity(1 + exchange.encoded_len());
                buf.push(Command::SetAdmAndMappings as u8);
                exchange.write_to(&mut buf);
                buf
            }
            other => vec![other.command() as u8],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&opcode, payload) = data.split_first().ok_or(ProtocolError::EmptyMessage)?;

        match Command::try_from(opcode)? {
            Command::GetConfig => Ok(CommandRequest::GetConfig),
            Command::StartRender => Ok(CommandRequest::StartRender),
            Command::StopRender => Ok(CommandRequest::StopRender),
            Command::GetAdmAndMappings => Ok(CommandRequest::GetAdmAndMappings),
            Command::SetAdmAndMappings => Ok(CommandRequest::SetAdmAndMappings(
                MetadataExchange::from_bytes(payload)?,
            )),
        }
    }
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Single-byte acknowledgement
    Ack(u8),
    Config(ConfigReport),
    Metadata(MetadataExchange),
}

impl CommandReply {
    /// Acknowledge a command by echoing its opcode
    pub fn ack(command: Command) -> Self {
        CommandReply::Ack(command as u8)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CommandReply::Ack(code) => vec![*code],
            CommandReply::Config(report) => report.to_bytes().to_vec(),
            CommandReply::Metadata(exchange) => {
                let mut buf = Vec::with_capacity(exchange.encoded_len());
                exchange.write_to(&mut buf);
                buf
            }
        }
    }

    /// Decode the reply to `command`
    ///
    /// Replies carry no type tag, so the layout is implied by the request.
    /// Export-source producers answer every single-byte command with a config
    /// report, so render acks accept either form.
    pub fn decode(command: Command, data: &[u8]) -> Result<Self, ProtocolError> {
        if data == [ERROR_REPLY] {
            return Err(ProtocolError::ProducerRejected(command));
        }

        match command {
            Command::GetConfig => match data.len() {
                CONFIG_REPORT_SIZE => Ok(CommandReply::Config(ConfigReport::from_bytes(data)?)),
                actual => Err(ProtocolError::WrongReplyLength { command, actual }),
            },
            Command::StartRender | Command::StopRender | Command::SetAdmAndMappings => {
                match data.len() {
                    1 => Ok(CommandReply::Ack(data[0])),
                    CONFIG_REPORT_SIZE => {
                        Ok(CommandReply::Config(ConfigReport::from_bytes(data)?))
                    }
                    actual => Err(ProtocolError::WrongReplyLength { command, actual }),
                }
            }
            Command::GetAdmAndMappings => {
                Ok(CommandReply::Metadata(MetadataExchange::from_bytes(data)?))
            }
        }
    }

    pub fn into_config(self, command: Command) -> Result<ConfigReport, ProtocolError> {
        match self {
            CommandReply::Config(report) => Ok(report),
            other => Err(ProtocolError::WrongReplyLength {
                command,
                actual: other.to_bytes().len(),
            }),
        }
    }

    pub fn into_metadata(self, command: Command) -> Result<MetadataExchange, ProtocolError> {
        match self {
            CommandReply::Metadata(exchange) => Ok(exchange),
            other => Err(ProtocolError::WrongReplyLength {
                command,
                actual: other.to_bytes().len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding_is_stable() {
        assert_eq!(Command::GetConfig as u8, 0);
        assert_eq!(Command::StartRender as u8, 1);
        assert_eq!(Command::StopRender as u8, 2);
        assert_eq!(Command::GetAdmAndMappings as u8, 3);
        assert_eq!(Command::SetAdmAndMappings as u8, 4);
        assert_eq!(Command::try_from(5), Err(ProtocolError::UnknownCommand(5)));
    }

    #[test]
    fn test_config_report_layout() {
        let report = ConfigReport {
            channels: 2,
            sample_rate: 48000,
            type_definition: 0x0001,
            pack_format_id: 0x0002,
            channel_format_id: 0x0003,
        };
        let bytes = report.to_bytes();

        assert_eq!(bytes.len(), CONFIG_REPORT_SIZE);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..5], &48000u32.to_le_bytes());
        assert_eq!(&bytes[5..7], &[0x01, 0x00]);
        assert_eq!(ConfigReport::from_bytes(&bytes).unwrap(), report);
        assert_eq!(report.pack_format_label(), "AP_00010002");
        assert_eq!(report.channel_format_label(), "AC_00010003");
    }

    #[test]
    fn test_config_report_too_short() {
        let result = ConfigReport::from_bytes(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(ProtocolError::Undersized { actual: 10, .. })
        ));
    }

    #[test]
    fn test_channel_table_mappings_are_dense() {
        let mut table = ChannelTable::new();
        table.set(1, 0x1001);
        table.set(4, 0x1004);
        table.set(5, 0x1005);
        table.set(63, 0x103F);

        let mappings = table.mappings(8);
        assert_eq!(mappings.len(), 3);
        assert_eq!(
            mappings[0],
            ChannelMapping {
                input_channel: 1,
                output_channel: 0,
                identifier: 0x1001
            }
        );
        assert_eq!(mappings[1].input_channel, 4);
        assert_eq!(mappings[1].output_channel, 1);
        assert_eq!(mappings[2].input_channel, 5);
        assert_eq!(mappings[2].output_channel, 2);

        // Slot 63 only counts once the producer reports all 64 channels
        assert_eq!(table.mappings(64).len(), 4);
        assert!(!table.set(64, 1));
    }

    #[test]
    fn test_set_request_carries_table_and_document() {
        let mut table = ChannelTable::new();
        table.set(0, 7);
        let request =
            CommandRequest::SetAdmAndMappings(MetadataExchange::new(table, "<adm/>"));
        let bytes = request.to_bytes();

        assert_eq!(bytes[0], Command::SetAdmAndMappings as u8);
        assert_eq!(bytes.len(), 1 + CHANNEL_TABLE_SIZE + 6);
        assert_eq!(CommandRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_simple_requests_are_one_byte() {
        assert_eq!(CommandRequest::GetConfig.to_bytes(), vec![0]);
        assert_eq!(CommandRequest::render(true).to_bytes(), vec![1]);
        assert_eq!(CommandRequest::render(false).to_bytes(), vec![2]);
        assert_eq!(
            CommandRequest::from_bytes(&[]),
            Err(ProtocolError::EmptyMessage)
        );
    }

    #[test]
    fn test_metadata_reply_undersized() {
        let result = CommandReply::decode(Command::GetAdmAndMappings, &[0u8; 100]);
        assert!(matches!(
            result,
            Err(ProtocolError::Undersized {
                expected: CHANNEL_TABLE_SIZE,
                ..
            })
        ));
    }

    #[test]
    fn test_metadata_reply_invalid_utf8() {
        let mut data = vec![0u8; CHANNEL_TABLE_SIZE];
        data.extend_from_slice(&[0xC3, 0x28]);
        assert_eq!(
            CommandReply::decode(Command::GetAdmAndMappings, &data),
            Err(ProtocolError::InvalidDocument)
        );
    }

    #[test]
    fn test_render_ack_accepts_config_report() {
        let report = ConfigReport {
            channels: 1,
            sample_rate: 44100,
            ..Default::default()
        };
        let reply = CommandReply::decode(Command::StartRender, &report.to_bytes()).unwrap();
        assert_eq!(reply, CommandReply::Config(report));

        let ack = CommandReply::decode(Command::StopRender, &[2]).unwrap();
        assert_eq!(ack, CommandReply::ack(Command::StopRender));
    }

    #[test]
    fn test_error_reply_is_rejection() {
        assert_eq!(
            CommandReply::decode(Command::StartRender, &[ERROR_REPLY]),
            Err(ProtocolError::ProducerRejected(Command::StartRender))
        );
    }

    #[test]
    fn test_config_reply_wrong_length() {
        assert_eq!(
            CommandReply::decode(Command::GetConfig, &[1]),
            Err(ProtocolError::WrongReplyLength {
                command: Command::GetConfig,
                actual: 1
            })
        );
    }
}
