//! Frame sources the aggregator can drive

use std::sync::Arc;

use crate::network::Communicator;

use super::error::ExportError;
use super::router::ChannelRouter;

/// Anything that yields frames of a fixed channel count on demand
pub trait FrameSource: Send {
    /// Label used in logs and reports
    fn name(&self) -> String;

    fn channel_count(&self) -> usize;

    /// Sample rate in Hz, 0 if unknown
    fn sample_rate(&self) -> u32;

    fn set_rendering(&mut self, state: bool) -> Result<(), ExportError>;

    /// Whether `copy_next_frame` can be called now; "not yet" is `Ok(false)`
    fn next_frame_available(&mut self) -> Result<bool, ExportError>;

    /// Copy one frame into `dst[..channel_count()]`
    fn copy_next_frame(&mut self, dst: &mut [f32]) -> Result<(), ExportError>;

    /// No frame will ever become available again
    fn is_exhausted(&self) -> bool {
        false
    }
}

impl FrameSource for Arc<Communicator> {
    fn name(&self) -> String {
        format!("{} {}", self.kind(), self.ports())
    }

    fn channel_count(&self) -> usize {
        Communicator::channel_count(self)
    }

    fn sample_rate(&self) -> u32 {
        Communicator::sample_rate(self)
    }

    fn set_rendering(&mut self, state: bool) -> Result<(), ExportError> {
        Ok(self.set_rendering_state(state)?)
    }

    fn next_frame_available(&mut self) -> Result<bool, ExportError> {
        Ok(Communicator::next_frame_available(self)?)
    }

    fn copy_next_frame(&mut self, dst: &mut [f32]) -> Result<(), ExportError> {
        // The aggregator only copies after every source reported a frame
        Ok(Communicator::copy_next_frame(self, dst, true)?)
    }

    fn is_exhausted(&self) -> bool {
        self.is_stream_ended()
    }
}

/// A source whose channels are re-mapped through a router
pub struct RoutedSource<S> {
    inner: S,
    router: ChannelRouter,
    scratch: Vec<f32>,
}

impl<S: FrameSource> RoutedSource<S> {
    /// Wrap `inner`; every route must exist in its current layout
    pub fn new(inner: S, router: ChannelRouter) -> Result<Self, ExportError> {
        router.validate(inner.channel_count())?;
        Ok(Self {
            inner,
            router,
            scratch: Vec::new(),
        })
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: FrameSource> FrameSource for RoutedSource<S> {
    fn name(&self) -> String {
        format!("{} (routed)", self.inner.name())
    }

    fn channel_count(&self) -> usize {
        self.router.output_channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn set_rendering(&mut self, state: bool) -> Result<(), ExportError> {
        self.inner.set_rendering(state)
    }

    fn next_frame_available(&mut self) -> Result<bool, ExportError> {
        self.inner.next_frame_available()
    }

    fn copy_next_frame(&mut self, dst: &mut [f32]) -> Result<(), ExportError> {
        self.scratch.resize(self.inner.channel_count(), 0.0);
        self.inner.copy_next_frame(&mut self.scratch)?;
        self.router.route_frame(&self.scratch, dst)
    }

    fn is_exhausted(&self) -> bool {
        self.inner.is_exhausted()
    }
}

/// Placeholder for a track with no live producer; always ready, always zero
#[derive(Debug, Clone)]
pub struct SilentSource {
    name: String,
    channels: usize,
    sample_rate: u32,
}

impl SilentSource {
    pub fn new(name: impl Into<String>, channels: usize, sample_rate: u32) -> Self {
        Self {
            name: name.into(),
            channels,
            sample_rate,
        }
    }
}

impl FrameSource for SilentSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_rendering(&mut self, _state: bool) -> Result<(), ExportError> {
        Ok(())
    }

    fn next_frame_available(&mut self) -> Result<bool, ExportError> {
        Ok(true)
    }

    fn copy_next_frame(&mut self, dst: &mut [f32]) -> Result<(), ExportError> {
        if dst.len() < self.channels {
            return Err(ExportError::ChannelCountMismatch {
                expected: self.channels,
                actual: dst.len(),
            });
        }
        dst[..self.channels].fill(0.0);
        Ok(())
    }
}
