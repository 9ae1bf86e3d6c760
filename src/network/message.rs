//! Owned transport messages and the typed sample view over them
//!
//! Received bytes are moved into a `MessageBuffer` as soon as they come off
//! the socket. `SampleBlock` reads interleaved little-endian `f32` samples
//! from that buffer with a sequential cursor.

use std::cell::Cell;

use super::error::NetworkError;

/// Size of one sample on the wire
pub const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

/// One transport message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBuffer {
    bytes: Vec<u8>,
}

impl MessageBuffer {
    /// Zero-filled buffer for building an outgoing message
    pub fn with_size(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    /// Copy received bytes into a new buffer
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn resize(&mut self, size: usize) {
        self.bytes.resize(size, 0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl From<Vec<u8>> for MessageBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// Interleaved `f32` samples with a sequential read cursor
///
/// A block can be drained across several calls; the cursor only moves when a
/// read succeeds or the caller skips explicitly.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    buffer: MessageBuffer,
    /// Cached element count, `None` after a resize
    data_count: Cell<Option<usize>>,
    read_pos: usize,
    channels: usize,
    sample_rate: u32,
}

impl SampleBlock {
    /// Typed view over a received message
    pub fn from_message(buffer: MessageBuffer) -> Result<Self, NetworkError> {
        if buffer.len() % SAMPLE_SIZE != 0 {
            return Err(NetworkError::MisalignedBlock(buffer.len()));
        }

        Ok(Self {
            buffer,
            data_count: Cell::new(None),
            read_pos: 0,
            channels: 0,
            sample_rate: 0,
        })
    }

    /// Encode samples into an outgoing block
    pub fn from_samples(samples: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_SIZE);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        Self {
            buffer: MessageBuffer::from(bytes),
            data_count: Cell::new(Some(samples.len())),
            read_pos: 0,
            channels: 0,
            sample_rate: 0,
        }
    }

    /// Tag the block with its stream format
    pub fn with_format(mut self, channels: usize, sample_rate: u32) -> Self {
        self.channels = channels;
        self.sample_rate = sample_rate;
        self
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total number of samples in the block
    pub fn data_count(&self) -> usize {
        match self.data_count.get() {
            Some(count) => count,
            None => {
                let count = self.buffer.len() / SAMPLE_SIZE;
                self.data_count.set(Some(count));
                count
            }
        }
    }

    /// Number of whole frames, if the channel count is known
    pub fn frame_count(&self) -> Option<usize> {
        (self.channels > 0).then(|| self.data_count() / self.channels)
    }

    /// Resize to hold `samples` samples; new samples are zero
    pub fn resize(&mut self, samples: usize) {
        self.buffer.resize(samples * SAMPLE_SIZE);
        self.data_count.set(None);
    }

    /// Current cursor position in samples
    pub fn seq_read_pos(&self) -> usize {
        self.read_pos
    }

    /// Samples left after the cursor
    pub fn remaining(&self) -> usize {
        self.data_count().saturating_sub(self.read_pos)
    }

    /// Whether the cursor has consumed every sample
    pub fn at_seq_read_end(&self) -> bool {
        self.read_pos >= self.data_count()
    }

    /// Copy `dst.len()` samples from the cursor and advance it
    ///
    /// Returns false without touching `dst` if fewer samples remain.
    pub fn seq_read_and_put(&mut self, dst: &mut [f32]) -> bool {
        if dst.len() > self.remaining() {
            return false;
        }

        let start = self.read_pos * SAMPLE_SIZE;
        let end = start + dst.len() * SAMPLE_SIZE;
        for (out, chunk) in dst
            .iter_mut()
            .zip(self.buffer.as_slice()[start..end].chunks_exact(SAMPLE_SIZE))
        {
            *out = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        self.read_pos += dst.len();
        true
    }

    /// Skip samples without copying them
    pub fn advance_seq_read_pos(&mut self, samples: usize) {
        self.read_pos = self.read_pos.saturating_add(samples);
    }

    /// Sample at an absolute index, ignoring the cursor
    pub fn sample_at(&self, index: usize) -> Option<f32> {
        if index >= self.data_count() {
            return None;
        }
        let start = index * SAMPLE_SIZE;
        let chunk = &self.buffer.as_slice()[start..start + SAMPLE_SIZE];
        Some(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// Unread samples, leaving the cursor in place
    pub fn unread(&self) -> Vec<f32> {
        (self.read_pos..self.data_count())
            .filter_map(|index| self.sample_at(index))
            .collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn into_message(self) -> MessageBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 * 0.5).collect()
    }

    #[test]
    fn test_message_copies_bytes() {
        let source = vec![1u8, 2, 3];
        let msg = MessageBuffer::from_bytes(&source);
        drop(source);
        assert_eq!(msg.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_wire_format_is_little_endian() {
        let block = SampleBlock::from_samples(&[1.0, -2.5]);
        let mut expected = 1.0f32.to_le_bytes().to_vec();
        expected.extend_from_slice(&(-2.5f32).to_le_bytes());
        assert_eq!(block.as_bytes(), expected.as_slice());
    }

    #[test]
    fn test_chunked_drain_matches_single_drain() {
        let samples = ramp(2 * 96);

        let mut whole = SampleBlock::from_samples(&samples);
        let mut all = vec![0.0; samples.len()];
        assert!(whole.seq_read_and_put(&mut all));
        assert!(whole.at_seq_read_end());

        let mut chunked = SampleBlock::from_samples(&samples);
        let mut collected = Vec::new();
        let mut chunk = [0.0f32; 2 * 7];
        while chunked.remaining() >= chunk.len() {
            assert!(chunked.seq_read_and_put(&mut chunk));
            collected.extend_from_slice(&chunk);
        }
        let mut tail = vec![0.0; chunked.remaining()];
        assert!(chunked.seq_read_and_put(&mut tail));
        collected.extend_from_slice(&tail);

        assert_eq!(collected, all);
        assert_eq!(all, samples);
    }

    #[test]
    fn test_overread_leaves_destination_untouched() {
        let mut block = SampleBlock::from_samples(&[1.0, 2.0, 3.0]);
        let mut first = [0.0f32; 2];
        assert!(block.seq_read_and_put(&mut first));

        let mut dst = [9.0f32; 2];
        assert!(!block.seq_read_and_put(&mut dst));
        assert_eq!(dst, [9.0, 9.0]);
        assert_eq!(block.seq_read_pos(), 2);
        assert!(!block.at_seq_read_end());
    }

    #[test]
    fn test_advance_skips_samples() {
        let mut block = SampleBlock::from_samples(&ramp(8));
        block.advance_seq_read_pos(5);
        let mut dst = [0.0f32; 1];
        assert!(block.seq_read_and_put(&mut dst));
        assert_eq!(dst[0], 2.5);

        block.advance_seq_read_pos(10);
        assert!(block.at_seq_read_end());
        assert_eq!(block.remaining(), 0);
    }

    #[test]
    fn test_resize_recomputes_count() {
        let mut block = SampleBlock::from_samples(&ramp(4));
        assert_eq!(block.data_count(), 4);
        block.resize(6);
        assert_eq!(block.data_count(), 6);
        assert_eq!(block.sample_at(5), Some(0.0));
        block.resize(2);
        assert_eq!(block.data_count(), 2);
        assert_eq!(block.sample_at(2), None);
    }

    #[test]
    fn test_misaligned_message_rejected() {
        let result = SampleBlock::from_message(MessageBuffer::with_size(6));
        assert!(matches!(result, Err(NetworkError::MisalignedBlock(6))));
    }

    #[test]
    fn test_frame_count_needs_channels() {
        let block = SampleBlock::from_samples(&ramp(12));
        assert_eq!(block.frame_count(), None);
        let block = block.with_format(3, 48000);
        assert_eq!(block.frame_count(), Some(4));
        assert_eq!(block.sample_rate(), 48000);
    }
}
