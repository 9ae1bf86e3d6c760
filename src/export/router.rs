//! Channel routing
//!
//! Maps the channels of an input layout onto an output layout, one entry per
//! output channel. Outputs with no input are filled with silence.

use serde::{Deserialize, Serialize};

use crate::network::SampleBlock;

use super::error::ExportError;

/// Where one output channel takes its samples from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSource {
    Input(usize),
    Silence,
}

/// Ordered list of routes, one per output channel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelRouter {
    routes: Vec<RouteSource>,
}

impl ChannelRouter {
    pub fn new(routes: Vec<RouteSource>) -> Self {
        Self { routes }
    }

    /// `[0, 1, ..., channels - 1]`
    pub fn identity(channels: usize) -> Self {
        Self::new((0..channels).map(RouteSource::Input).collect())
    }

    /// `channels` silent outputs
    pub fn silent(channels: usize) -> Self {
        Self::new(vec![RouteSource::Silence; channels])
    }

    /// Build from integer indices; any negative index means silence
    pub fn from_indices(indices: &[i32]) -> Self {
        Self::new(
            indices
                .iter()
                .map(|&i| match usize::try_from(i) {
                    Ok(i) => RouteSource::Input(i),
                    Err(_) => RouteSource::Silence,
                })
                .collect(),
        )
    }

    pub fn routes(&self) -> &[RouteSource] {
        &self.routes
    }

    pub fn output_channels(&self) -> usize {
        self.routes.len()
    }

    /// Smallest input width every route can be served from
    pub fn required_input_channels(&self) -> usize {
        self.routes
            .iter()
            .filter_map(|r| match r {
                RouteSource::Input(i) => Some(i + 1),
                RouteSource::Silence => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Check every route against an input width
    pub fn validate(&self, input_channels: usize) -> Result<(), ExportError> {
        match self.required_input_channels() {
            required if required > input_channels => Err(ExportError::RouteOutOfRange {
                route: required - 1,
                channels: input_channels,
            }),
            _ => Ok(()),
        }
    }

    /// Route one frame
    pub fn route_frame(&self, input: &[f32], output: &mut [f32]) -> Result<(), ExportError> {
        if output.len() < self.routes.len() {
            return Err(ExportError::ChannelCountMismatch {
                expected: self.routes.len(),
                actual: output.len(),
            });
        }

        for (out, route) in output.iter_mut().zip(&self.routes) {
            *out = match *route {
                RouteSource::Input(i) => {
                    *input.get(i).ok_or(ExportError::RouteOutOfRange {
                        route: i,
                        channels: input.len(),
                    })?
                }
                RouteSource::Silence => 0.0,
            };
        }
        Ok(())
    }

    /// Route every unread frame of a block into a new block
    ///
    /// The input block must carry its channel count. The output carries the
    /// router's channel count and the input's sample rate.
    pub fn write(&self, block: &SampleBlock) -> Result<SampleBlock, ExportError> {
        let channels = block.channels();
        if channels == 0 {
            return Err(ExportError::UnknownChannelLayout);
        }
        self.validate(channels)?;

        let input = block.unread();
        let outputs = self.output_channels();
        let mut output = vec![0.0f32; input.len() / channels * outputs];

        for (frame_in, frame_out) in input
            .chunks_exact(channels)
            .zip(output.chunks_exact_mut(outputs.max(1)))
        {
            self.route_frame(frame_in, frame_out)?;
        }

        Ok(SampleBlock::from_samples(&output).with_format(outputs, block.sample_rate()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(samples: &[f32], channels: usize) -> SampleBlock {
        SampleBlock::from_samples(samples).with_format(channels, 48000)
    }

    #[test]
    fn test_identity_reproduces_input() {
        let samples: Vec<f32> = (0..30).map(|i| i as f32 - 15.0).collect();
        let input = block(&samples, 3);

        let output = ChannelRouter::identity(3).write(&input).unwrap();
        assert_eq!(output.channels(), 3);
        assert_eq!(output.sample_rate(), 48000);
        assert_eq!(output.unread(), samples);
    }

    #[test]
    fn test_all_silence_is_zero() {
        let input = block(&[0.7; 20], 2);

        let output = ChannelRouter::silent(5).write(&input).unwrap();
        assert_eq!(output.channels(), 5);
        assert_eq!(output.frame_count(), Some(10));
        assert!(output.unread().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_subset_and_placeholder() {
        let input = block(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3);
        let router = ChannelRouter::from_indices(&[2, -1, 0]);

        let output = router.write(&input).unwrap();
        assert_eq!(output.unread(), vec![3.0, 0.0, 1.0, 6.0, 0.0, 4.0]);
    }

    #[test]
    fn test_route_out_of_range() {
        let input = block(&[0.0; 4], 2);
        let result = ChannelRouter::from_indices(&[0, 2]).write(&input);
        assert!(matches!(
            result,
            Err(ExportError::RouteOutOfRange {
                route: 2,
                channels: 2
            })
        ));
    }

    #[test]
    fn test_block_without_layout() {
        let input = SampleBlock::from_samples(&[0.0; 4]);
        assert!(matches!(
            ChannelRouter::identity(1).write(&input),
            Err(ExportError::UnknownChannelLayout)
        ));
    }

    #[test]
    fn test_only_unread_frames_are_routed() {
        let mut input = block(&[1.0, 2.0, 3.0, 4.0], 2);
        input.advance_seq_read_pos(2);

        let output = ChannelRouter::from_indices(&[1]).write(&input).unwrap();
        assert_eq!(output.unread(), vec![4.0]);
    }
}
