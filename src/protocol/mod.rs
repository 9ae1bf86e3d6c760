//! Command protocol definitions
//!
//! Defines the control operations exchanged between the export coordinator
//! and producer plugin instances, and their binary payloads.

mod command;
mod error;

pub use command::{
    ChannelMapping, ChannelTable, Command, CommandReply, CommandRequest, ConfigReport,
    MetadataExchange, CHANNEL_TABLE_SIZE, CONFIG_REPORT_SIZE, ERROR_REPLY, MAX_CHANNEL_SLOTS,
};
pub use error::ProtocolError;
