//! Export module
//!
//! Aggregates frames from several sources into one multichannel output,
//! with channel routing and WAV writing.

mod aggregator;
mod error;
mod router;
mod source;
mod writer;

pub use aggregator::{
    AggregatorState, ExportAggregator, ExportConfig, ExportIssue, ExportReport, SourceReport,
};
pub use error::ExportError;
pub use router::{ChannelRouter, RouteSource};
pub use source::{FrameSource, RoutedSource, SilentSource};
pub use writer::{FrameWriter, MemoryWriter, WavWriter, DEFAULT_BITS_PER_SAMPLE, WAV_HEADER_SIZE};
