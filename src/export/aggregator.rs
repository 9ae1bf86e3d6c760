//! Export aggregation
//!
//! Drives a set of frame sources in lockstep: a frame is written only when
//! every attached source can supply one, so channels from independently
//! scheduled producers stay sample-aligned. On close, buffered frames are
//! drained for a bounded grace period and any shortfall is reported.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::error::ExportError;
use super::source::FrameSource;
use super::writer::FrameWriter;

/// Aggregator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Sleep between drain polls on close
    pub drain_poll_interval_ms: u64,
    /// Drain polls before giving up
    pub drain_max_polls: u32,
    /// Frames batched per writer call
    pub block_frames: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval_ms: 50,
            drain_max_polls: 40,
            block_frames: 1024,
        }
    }
}

impl ExportConfig {
    /// Validate and normalize the configuration
    pub fn validated(self) -> Self {
        Self {
            block_frames: self.block_frames.max(1),
            ..self
        }
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    /// Upper bound on the close-time drain
    pub fn drain_deadline(&self) -> Duration {
        self.drain_poll_interval() * self.drain_max_polls
    }
}

/// Aggregator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregatorState {
    /// No sources attached
    Idle,
    /// Sources attached, rendering not yet signalled
    Armed,
    /// Rendering signalled to every source
    Running,
    /// Rendering stopped, flushing buffered frames
    Draining,
    Closed,
}

/// Problems found before rendering starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportIssue {
    NoSources,
    NoChannels,
    UnknownSampleRate { source: String },
    SampleRateMismatch {
        source: String,
        expected: u32,
        actual: u32,
    },
}

impl std::fmt::Display for ExportIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportIssue::NoSources => write!(f, "No suitable export sources"),
            ExportIssue::NoChannels => write!(
                f,
                "The current configuration of export sources will export 0 channels of audio"
            ),
            ExportIssue::UnknownSampleRate { source } => {
                write!(f, "Source \"{}\" has not reported a sample rate", source)
            }
            ExportIssue::SampleRateMismatch {
                source,
                expected,
                actual,
            } => write!(
                f,
                "Source \"{}\" sample rate ({}) does not match export sample rate ({})",
                source, actual, expected
            ),
        }
    }
}

/// Per-source delivery at close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub name: String,
    pub channels: usize,
    pub frames_delivered: u64,
    pub frames_missing: u64,
    /// Had no frame ready when the drain gave up
    pub stalled: bool,
    /// Closed its stream; no further frames will arrive
    pub stream_ended: bool,
}

/// Outcome of an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub session_id: Uuid,
    pub expected_frames: u64,
    pub written_frames: u64,
    pub shortfall: u64,
    pub sources: Vec<SourceReport>,
    pub warnings: Vec<String>,
}

impl ExportReport {
    pub fn is_complete(&self) -> bool {
        self.shortfall == 0
    }
}

struct AttachedSource {
    source: Box<dyn FrameSource>,
    frames_delivered: u64,
}

/// Lockstep frame aggregator feeding one writer
pub struct ExportAggregator {
    id: Uuid,
    config: ExportConfig,
    state: AggregatorState,
    sources: Vec<AttachedSource>,
    expected_frames: u64,
    written_frames: u64,
    /// Interleaved frames awaiting the writer
    batch: Vec<f32>,
    /// Source whose failed copy left the others one frame ahead
    misaligned: Option<String>,
}

impl ExportAggregator {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config: config.validated(),
            state: AggregatorState::Idle,
            sources: Vec::new(),
            expected_frames: 0,
            written_frames: 0,
            batch: Vec::new(),
            misaligned: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.source.name()).collect()
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[AggregatorState],
    ) -> Result<(), ExportError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExportError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Add a source; its channels follow those already attached
    pub fn attach<S: FrameSource + 'static>(&mut self, source: S) -> Result<(), ExportError> {
        self.require("attach", &[AggregatorState::Idle, AggregatorState::Armed])?;

        info!(
            "Export {} attached {} ({} channels)",
            self.id,
            source.name(),
            source.channel_count()
        );
        self.sources.push(AttachedSource {
            source: Box::new(source),
            frames_delivered: 0,
        });
        self.state = AggregatorState::Armed;
        Ok(())
    }

    /// Remove the first source named `name`
    pub fn detach(&mut self, name: &str) -> Result<Option<Box<dyn FrameSource>>, ExportError> {
        self.require("detach", &[AggregatorState::Idle, AggregatorState::Armed])?;

        let Some(index) = self.sources.iter().position(|s| s.source.name() == name) else {
            return Ok(None);
        };
        let removed = self.sources.remove(index);
        if self.sources.is_empty() {
            self.state = AggregatorState::Idle;
        }

        info!("Export {} detached {}", self.id, name);
        Ok(Some(removed.source))
    }

    /// Width of an exported frame
    pub fn total_channels(&self) -> usize {
        self.sources.iter().map(|s| s.source.channel_count()).sum()
    }

    /// Rate of the first source that reports one
    pub fn sample_rate(&self) -> Option<u32> {
        self.sources
            .iter()
            .map(|s| s.source.sample_rate())
            .find(|&rate| rate > 0)
    }

    pub fn validate(&self) -> Vec<ExportIssue> {
        let mut issues = Vec::new();
        if self.sources.is_empty() {
            issues.push(ExportIssue::NoSources);
            return issues;
        }
        if self.total_channels() == 0 {
            issues.push(ExportIssue::NoChannels);
        }

        let expected = self.sample_rate();
        for attached in &self.sources {
            let actual = attached.source.sample_rate();
            match expected {
                _ if actual == 0 => issues.push(ExportIssue::UnknownSampleRate {
                    source: attached.source.name(),
                }),
                Some(expected) if expected != actual => {
                    issues.push(ExportIssue::SampleRateMismatch {
                        source: attached.source.name(),
                        expected,
                        actual,
                    })
                }
                _ => {}
            }
        }
        issues
    }

    pub fn expected_frames(&self) -> u64 {
        self.expected_frames
    }

    pub fn set_expected_frames(&mut self, frames: u64) {
        self.expected_frames = frames;
    }

    /// The host announces each block it renders
    pub fn add_expected_frames(&mut self, frames: u64) {
        self.expected_frames += frames;
    }

    pub fn written_frames(&self) -> u64 {
        self.written_frames
    }

    /// Broadcast the rendering state to every source
    ///
    /// Starting moves Armed to Running; stopping moves Running to Draining.
    /// Repeating the current state is a no-op.
    pub fn set_render_in_progress(&mut self, rendering: bool) -> Result<(), ExportError> {
        let _span = info_span!("export", session = %self.id).entered();

        match (rendering, self.state) {
            (true, AggregatorState::Running) | (false, AggregatorState::Armed) => return Ok(()),
            (false, AggregatorState::Draining) => return Ok(()),
            (true, AggregatorState::Armed) | (false, AggregatorState::Running) => {}
            _ => {
                return Err(ExportError::InvalidState {
                    operation: if rendering {
                        "start rendering"
                    } else {
                        "stop rendering"
                    },
                    state: self.state,
                })
            }
        }

        if rendering {
            for index in 0..self.sources.len() {
                if let Err(e) = self.sources[index].source.set_rendering(true) {
                    // Leave no producer streaming into an export that never started
                    for started in &mut self.sources[..index] {
                        if let Err(stop) = started.source.set_rendering(false) {
                            warn!("Failed to stop {}: {}", started.source.name(), stop);
                        }
                    }
                    return Err(e);
                }
            }
            self.state = AggregatorState::Running;
            info!("Rendering started on {} sources", self.sources.len());
            Ok(())
        } else {
            let mut first_error = None;
            for attached in &mut self.sources {
                if let Err(e) = attached.source.set_rendering(false) {
                    warn!("Failed to stop {}: {}", attached.source.name(), e);
                    first_error.get_or_insert(e);
                }
            }
            self.state = AggregatorState::Draining;
            info!("Rendering stopped, draining");
            first_error.map_or(Ok(()), Err)
        }
    }

    /// True only when every source can supply a frame
    pub fn is_frame_available(&mut self) -> Result<bool, ExportError> {
        if self.state == AggregatorState::Closed {
            return Err(ExportError::InvalidState {
                operation: "poll",
                state: self.state,
            });
        }
        if let Some(name) = &self.misaligned {
            return Err(ExportError::Misaligned(name.clone()));
        }
        if self.sources.is_empty() {
            return Ok(false);
        }

        for attached in &mut self.sources {
            if !attached.source.next_frame_available()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Copy one frame from every source into `buf`, in attachment order
    ///
    /// Every source is checked before any is advanced, so a source without a
    /// frame leaves the streams untouched. A copy that still fails leaves the
    /// earlier sources one frame ahead; that ends the export, and every later
    /// read fails with `Misaligned`.
    pub fn read_next_frame(&mut self, buf: &mut [f32]) -> Result<(), ExportError> {
        if let Some(name) = &self.misaligned {
            return Err(ExportError::Misaligned(name.clone()));
        }
        let total = self.total_channels();
        if buf.len() < total {
            return Err(ExportError::ChannelCountMismatch {
                expected: total,
                actual: buf.len(),
            });
        }

        for attached in &mut self.sources {
            if !attached.source.next_frame_available()? {
                return Err(ExportError::FrameNotReady(attached.source.name()));
            }
        }

        let mut offset = 0;
        for (index, attached) in self.sources.iter_mut().enumerate() {
            let channels = attached.source.channel_count();
            if let Err(e) = attached
                .source
                .copy_next_frame(&mut buf[offset..offset + channels])
            {
                let name = attached.source.name();
                if index > 0 {
                    warn!("Copy from {} failed after {} sources advanced: {}", name, index, e);
                    self.misaligned = Some(name);
                }
                return Err(e);
            }
            attached.frames_delivered += 1;
            offset += channels;
        }
        Ok(())
    }

    /// Write one frame if every source has one
    pub fn write_next_frame(&mut self, writer: &mut dyn FrameWriter) -> Result<bool, ExportError> {
        if !self.is_frame_available()? {
            return Ok(false);
        }

        let total = self.total_channels();
        let mut frame = std::mem::take(&mut self.batch);
        frame.clear();
        frame.resize(total, 0.0);

        let result = self
            .read_next_frame(&mut frame)
            .and_then(|()| writer.write_frames(&frame, total));
        self.batch = frame;
        result?;

        self.written_frames += 1;
        Ok(true)
    }

    /// Write every frame available now, in batches
    ///
    /// Stops at the expected count when one is set. Returns frames written.
    pub fn process_available(&mut self, writer: &mut dyn FrameWriter) -> Result<u64, ExportError> {
        let total = self.total_channels();
        if total == 0 {
            return Ok(0);
        }

        let mut batch = std::mem::take(&mut self.batch);
        batch.clear();
        let result = self.fill_batches(writer, &mut batch, total);
        self.batch = batch;
        result
    }

    /// Frames already read into `batch` are written and counted even when a
    /// later poll or copy fails; the error is returned after the flush.
    fn fill_batches(
        &mut self,
        writer: &mut dyn FrameWriter,
        batch: &mut Vec<f32>,
        total: usize,
    ) -> Result<u64, ExportError> {
        let mut written = 0u64;
        let mut frames_in_batch = 0usize;
        let mut fault = None;

        loop {
            let pending = self.written_frames + frames_in_batch as u64;
            if self.expected_frames > 0 && pending >= self.expected_frames {
                break;
            }
            match self.is_frame_available() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }

            let start = batch.len();
            batch.resize(start + total, 0.0);
            if let Err(e) = self.read_next_frame(&mut batch[start..]) {
                batch.truncate(start);
                fault = Some(e);
                break;
            }
            frames_in_batch += 1;

            if frames_in_batch == self.config.block_frames {
                written += self.flush_batch(writer, batch, total)?;
                frames_in_batch = 0;
            }
        }

        if frames_in_batch > 0 {
            written += self.flush_batch(writer, batch, total)?;
        }

        if written > 0 {
            debug!("Wrote {} frames ({} total)", written, self.written_frames);
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn flush_batch(
        &mut self,
        writer: &mut dyn FrameWriter,
        batch: &mut Vec<f32>,
        total: usize,
    ) -> Result<u64, ExportError> {
        writer.write_frames(batch, total)?;
        let frames = (batch.len() / total) as u64;
        self.written_frames += frames;
        batch.clear();
        Ok(frames)
    }

    /// Stop rendering, drain for the grace period, finalize the writer
    ///
    /// A shortfall is not an error: the output is still finalized and the
    /// report names the sources that fell behind.
    pub fn close(&mut self, writer: &mut dyn FrameWriter) -> Result<ExportReport, ExportError> {
        if self.state == AggregatorState::Closed {
            return Err(ExportError::InvalidState {
                operation: "close",
                state: self.state,
            });
        }
        let _span = info_span!("export", session = %self.id).entered();
        let mut warnings = Vec::new();

        if self.state == AggregatorState::Running {
            if let Err(e) = self.set_render_in_progress(false) {
                warnings.push(format!("Failed to stop rendering: {}", e));
            }
        }
        if !self.sources.is_empty() {
            self.state = AggregatorState::Draining;
            match &self.misaligned {
                Some(name) => warnings.push(format!(
                    "Export ended early: sources out of alignment after {}",
                    name
                )),
                None => self.drain(writer, &mut warnings)?,
            }
        }

        let shortfall = self.expected_frames.saturating_sub(self.written_frames);
        let mut sources = Vec::with_capacity(self.sources.len());
        for attached in &mut self.sources {
            let frames_missing = self.expected_frames.saturating_sub(attached.frames_delivered);
            let stalled = frames_missing > 0
                && !attached.source.next_frame_available().unwrap_or(false);
            sources.push(SourceReport {
                name: attached.source.name(),
                channels: attached.source.channel_count(),
                frames_delivered: attached.frames_delivered,
                frames_missing,
                stalled,
                stream_ended: attached.source.is_exhausted(),
            });
        }

        if shortfall > 0 {
            let names = |pick: fn(&SourceReport) -> bool| {
                let names: Vec<&str> = sources
                    .iter()
                    .filter(|s| pick(s))
                    .map(|s| s.name.as_str())
                    .collect();
                if names.is_empty() {
                    "none".to_string()
                } else {
                    names.join(", ")
                }
            };
            let message = format!(
                "Received {} frames, expected {} ({} missing); sources not ready: {}; \
                 streams closed: {}",
                self.written_frames,
                self.expected_frames,
                shortfall,
                names(|s| s.stalled),
                names(|s| s.stream_ended)
            );
            warn!("{}", message);
            warnings.push(message);
        }

        writer.finalize()?;
        self.state = AggregatorState::Closed;

        info!(
            "Export closed: {} of {} frames written",
            self.written_frames, self.expected_frames
        );

        Ok(ExportReport {
            session_id: self.id,
            expected_frames: self.expected_frames,
            written_frames: self.written_frames,
            shortfall,
            sources,
            warnings,
        })
    }

    fn drain(
        &mut self,
        writer: &mut dyn FrameWriter,
        warnings: &mut Vec<String>,
    ) -> Result<(), ExportError> {
        let interval = self.config.drain_poll_interval();
        let mut polls = 0;

        while self.written_frames < self.expected_frames && polls < self.config.drain_max_polls {
            match self.process_available(writer) {
                Ok(_) => {}
                Err(ExportError::Network(e)) => {
                    warn!("Drain stopped by network error: {}", e);
                    warnings.push(format!("Drain stopped early: {}", e));
                    break;
                }
                Err(e) => return Err(e),
            }
            if self.written_frames >= self.expected_frames {
                break;
            }
            if let Some(ended) = self.sources.iter().find(|s| s.source.is_exhausted()) {
                debug!("{} has no more frames, ending drain", ended.source.name());
                break;
            }

            std::thread::sleep(interval);
            polls += 1;
        }

        debug!("Drain finished after {} polls", polls);
        Ok(())
    }
}

impl Default for ExportAggregator {
    fn default() -> Self {
        Self::new(ExportConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::export::source::SilentSource;
    use crate::export::writer::MemoryWriter;
    use crate::network::NetworkError;

    /// Frames queued by the test, shared so they can be fed mid-export
    #[derive(Clone, Default)]
    struct Feed(Arc<Mutex<VecDeque<Vec<f32>>>>, Arc<AtomicBool>);

    impl Feed {
        fn push(&self, frame: &[f32]) {
            self.0.lock().push_back(frame.to_vec());
        }

        fn len(&self) -> usize {
            self.0.lock().len()
        }

        /// No frames after those already queued
        fn close(&self) {
            self.1.store(true, Ordering::Relaxed);
        }
    }

    struct QueueSource {
        name: String,
        channels: usize,
        feed: Feed,
        rendering: Arc<Mutex<bool>>,
    }

    impl QueueSource {
        fn new(name: &str, channels: usize) -> (Self, Feed) {
            let feed = Feed::default();
            let source = Self {
                name: name.to_string(),
                channels,
                feed: feed.clone(),
                rendering: Arc::new(Mutex::new(false)),
            };
            (source, feed)
        }
    }

    impl FrameSource for QueueSource {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn channel_count(&self) -> usize {
            self.channels
        }

        fn sample_rate(&self) -> u32 {
            48000
        }

        fn set_rendering(&mut self, state: bool) -> Result<(), ExportError> {
            *self.rendering.lock() = state;
            Ok(())
        }

        fn next_frame_available(&mut self) -> Result<bool, ExportError> {
            Ok(self.feed.len() > 0)
        }

        fn copy_next_frame(&mut self, dst: &mut [f32]) -> Result<(), ExportError> {
            let frame = self
                .feed
                .0
                .lock()
                .pop_front()
                .ok_or_else(|| ExportError::FrameNotReady(self.name.clone()))?;
            dst[..self.channels].copy_from_slice(&frame);
            Ok(())
        }

        fn is_exhausted(&self) -> bool {
            self.feed.1.load(Ordering::Relaxed) && self.feed.len() == 0
        }
    }

    /// How a `ScriptedSource` fails once its frames run out
    enum Ending {
        /// Polling fails, as when the producer connection breaks
        PollError,
        /// Polling still says ready, but the copy fails
        CopyError,
    }

    /// Yields `frames` frames of ones, then fails
    struct ScriptedSource {
        frames: usize,
        ending: Ending,
    }

    impl FrameSource for ScriptedSource {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn channel_count(&self) -> usize {
            1
        }

        fn sample_rate(&self) -> u32 {
            48000
        }

        fn set_rendering(&mut self, _state: bool) -> Result<(), ExportError> {
            Ok(())
        }

        fn next_frame_available(&mut self) -> Result<bool, ExportError> {
            match self.ending {
                Ending::PollError if self.frames == 0 => Err(NetworkError::Disconnected.into()),
                _ => Ok(true),
            }
        }

        fn copy_next_frame(&mut self, dst: &mut [f32]) -> Result<(), ExportError> {
            if self.frames == 0 {
                return Err(ExportError::FrameNotReady(self.name()));
            }
            self.frames -= 1;
            dst[0] = 1.0;
            Ok(())
        }
    }

    fn fast_config() -> ExportConfig {
        ExportConfig {
            drain_poll_interval_ms: 5,
            drain_max_polls: 4,
            block_frames: 3,
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut aggregator = ExportAggregator::new(fast_config());
        assert_eq!(aggregator.state(), AggregatorState::Idle);

        let (source, _feed) = QueueSource::new("a", 1);
        aggregator.attach(source).unwrap();
        assert_eq!(aggregator.state(), AggregatorState::Armed);

        aggregator.set_render_in_progress(true).unwrap();
        aggregator.set_render_in_progress(true).unwrap();
        assert_eq!(aggregator.state(), AggregatorState::Running);

        let (late, _feed) = QueueSource::new("late", 1);
        assert!(matches!(
            aggregator.attach(late),
            Err(ExportError::InvalidState {
                state: AggregatorState::Running,
                ..
            })
        ));

        aggregator.set_render_in_progress(false).unwrap();
        assert_eq!(aggregator.state(), AggregatorState::Draining);

        let mut writer = MemoryWriter::new(1);
        aggregator.close(&mut writer).unwrap();
        assert_eq!(aggregator.state(), AggregatorState::Closed);
        assert!(aggregator.close(&mut writer).is_err());
    }

    #[test]
    fn test_stop_broadcasts_false() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let (source, _feed) = QueueSource::new("a", 1);
        let rendering = source.rendering.clone();
        aggregator.attach(source).unwrap();

        aggregator.set_render_in_progress(true).unwrap();
        assert!(*rendering.lock());
        aggregator.set_render_in_progress(false).unwrap();
        assert!(!*rendering.lock());
    }

    #[test]
    fn test_detach_returns_to_idle() {
        let mut aggregator = ExportAggregator::new(fast_config());
        aggregator.attach(SilentSource::new("pad", 2, 48000)).unwrap();

        assert!(aggregator.detach("missing").unwrap().is_none());
        assert!(aggregator.detach("pad").unwrap().is_some());
        assert_eq!(aggregator.state(), AggregatorState::Idle);
        assert_eq!(aggregator.validate(), vec![ExportIssue::NoSources]);
    }

    #[test]
    fn test_validate_reports_rate_mismatch() {
        let mut aggregator = ExportAggregator::new(fast_config());
        aggregator.attach(SilentSource::new("a", 1, 48000)).unwrap();
        aggregator.attach(SilentSource::new("b", 1, 44100)).unwrap();
        aggregator.attach(SilentSource::new("c", 0, 0)).unwrap();

        let issues = aggregator.validate();
        assert!(issues.contains(&ExportIssue::SampleRateMismatch {
            source: "b".to_string(),
            expected: 48000,
            actual: 44100
        }));
        assert!(issues.contains(&ExportIssue::UnknownSampleRate {
            source: "c".to_string()
        }));
        assert_eq!(aggregator.sample_rate(), Some(48000));
    }

    #[test]
    fn test_gate_waits_for_every_source() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let (left, left_feed) = QueueSource::new("left", 1);
        let (right, right_feed) = QueueSource::new("right", 2);
        aggregator.attach(left).unwrap();
        aggregator.attach(right).unwrap();
        aggregator.set_render_in_progress(true).unwrap();

        left_feed.push(&[1.0]);
        left_feed.push(&[2.0]);
        assert!(!aggregator.is_frame_available().unwrap());

        right_feed.push(&[10.0, 11.0]);
        assert!(aggregator.is_frame_available().unwrap());

        let mut writer = MemoryWriter::new(3);
        assert!(aggregator.write_next_frame(&mut writer).unwrap());
        assert_eq!(writer.frame(0), Some(&[1.0, 10.0, 11.0][..]));
        assert_eq!(left_feed.len(), 1);
        assert_eq!(right_feed.len(), 0);

        assert!(!aggregator.write_next_frame(&mut writer).unwrap());
        assert_eq!(aggregator.written_frames(), 1);
    }

    #[test]
    fn test_process_available_stops_at_expected() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let (source, feed) = QueueSource::new("a", 1);
        aggregator.attach(source).unwrap();
        aggregator.set_render_in_progress(true).unwrap();
        for i in 0..10 {
            feed.push(&[i as f32]);
        }

        aggregator.set_expected_frames(7);
        let mut writer = MemoryWriter::new(1);
        assert_eq!(aggregator.process_available(&mut writer).unwrap(), 7);
        assert_eq!(writer.samples(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(feed.len(), 3);
    }

    #[test]
    fn test_close_reports_shortfall_and_finalizes() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let (fast, fast_feed) = QueueSource::new("fast", 1);
        let (slow, slow_feed) = QueueSource::new("slow", 1);
        aggregator.attach(fast).unwrap();
        aggregator.attach(slow).unwrap();
        aggregator.set_render_in_progress(true).unwrap();

        for _ in 0..5 {
            fast_feed.push(&[0.5]);
        }
        for _ in 0..3 {
            slow_feed.push(&[0.25]);
        }
        aggregator.add_expected_frames(2);
        aggregator.add_expected_frames(3);

        let mut writer = MemoryWriter::new(2);
        let report = aggregator.close(&mut writer).unwrap();

        assert!(writer.is_finalized());
        assert_eq!(report.written_frames, 3);
        assert_eq!(report.shortfall, 2);
        assert!(!report.is_complete());
        assert_eq!(report.warnings.len(), 1);

        let slow_report = &report.sources[1];
        assert_eq!(slow_report.name, "slow");
        assert!(slow_report.stalled);
        assert_eq!(slow_report.frames_missing, 2);
        assert!(!report.sources[0].stalled);
    }

    #[test]
    fn test_close_without_sources() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let mut writer = MemoryWriter::new(0);
        let report = aggregator.close(&mut writer).unwrap();
        assert!(report.is_complete());
        assert!(writer.is_finalized());
    }

    /// Test: Frames read before a failure are kept
    /// Given a source that delivers 5 frames and then loses its connection
    /// When the batch is processed with 3 frames per writer call
    /// Then all 5 frames are written and counted before the error is returned
    #[test]
    fn test_batch_flushed_before_error() {
        let mut aggregator = ExportAggregator::new(fast_config());
        aggregator
            .attach(ScriptedSource {
                frames: 5,
                ending: Ending::PollError,
            })
            .unwrap();
        aggregator.set_render_in_progress(true).unwrap();
        aggregator.set_expected_frames(10);

        let mut writer = MemoryWriter::new(1);
        let result = aggregator.process_available(&mut writer);

        assert!(matches!(result, Err(ExportError::Network(_))));
        assert_eq!(aggregator.written_frames(), 5);
        assert_eq!(writer.frames_written(), 5);
    }

    /// Test: A closed stream ends the drain
    /// Given a source whose feed is closed after 2 of 5 expected frames
    /// When the export is closed with a long grace period
    /// Then close returns without waiting it out and reports the closed stream
    #[test]
    fn test_closed_stream_ends_drain() {
        let config = ExportConfig {
            drain_poll_interval_ms: 50,
            drain_max_polls: 100,
            block_frames: 3,
        };
        let mut aggregator = ExportAggregator::new(config);
        let (source, feed) = QueueSource::new("a", 1);
        aggregator.attach(source).unwrap();
        aggregator.set_render_in_progress(true).unwrap();

        feed.push(&[0.1]);
        feed.push(&[0.2]);
        feed.close();
        aggregator.set_expected_frames(5);

        let started = Instant::now();
        let mut writer = MemoryWriter::new(1);
        let report = aggregator.close(&mut writer).unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.written_frames, 2);
        assert_eq!(report.shortfall, 3);
        assert!(report.sources[0].stream_ended);
        assert!(report.warnings[0].contains("streams closed: a"));
        assert_eq!(writer.samples(), &[0.1, 0.2]);
    }

    /// Test: Sources are only advanced together
    /// Given one source with a frame and one without
    /// When a frame is read directly
    /// Then it fails and the ready source keeps its frame
    #[test]
    fn test_read_checks_every_source_first() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let (ready, ready_feed) = QueueSource::new("ready", 1);
        let (empty, _empty_feed) = QueueSource::new("empty", 1);
        aggregator.attach(ready).unwrap();
        aggregator.attach(empty).unwrap();
        aggregator.set_render_in_progress(true).unwrap();
        ready_feed.push(&[0.5]);

        let mut frame = [0.0f32; 2];
        let result = aggregator.read_next_frame(&mut frame);

        assert!(matches!(result, Err(ExportError::FrameNotReady(name)) if name == "empty"));
        assert_eq!(ready_feed.len(), 1);
        assert!(aggregator.is_frame_available().is_ok());
    }

    /// Test: A failed copy after others advanced ends the export
    /// Given a source that claims a frame but fails to copy it
    /// When it fails after the source before it advanced
    /// Then later reads fail as misaligned and close still finalizes the output
    #[test]
    fn test_partial_copy_ends_export() {
        let mut aggregator = ExportAggregator::new(fast_config());
        let (first, feed) = QueueSource::new("first", 1);
        aggregator.attach(first).unwrap();
        aggregator
            .attach(ScriptedSource {
                frames: 1,
                ending: Ending::CopyError,
            })
            .unwrap();
        aggregator.set_render_in_progress(true).unwrap();
        for _ in 0..3 {
            feed.push(&[0.25]);
        }

        let mut writer = MemoryWriter::new(2);
        assert!(aggregator.write_next_frame(&mut writer).unwrap());
        assert!(aggregator.write_next_frame(&mut writer).is_err());
        assert!(matches!(
            aggregator.is_frame_available(),
            Err(ExportError::Misaligned(name)) if name == "scripted"
        ));

        let report = aggregator.close(&mut writer).unwrap();
        assert!(writer.is_finalized());
        assert_eq!(report.written_frames, 1);
        assert!(report.warnings.iter().any(|w| w.contains("alignment")));
    }
}
