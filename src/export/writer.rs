//! Output writers for aggregated frames
//!
//! `WavWriter` streams interleaved frames to a RIFF/WAVE file, writing a
//! placeholder header first and patching the sizes on finalize.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use super::error::ExportError;

/// WAV file header constants
const RIFF_HEADER: &[u8] = b"RIFF";
const WAVE_HEADER: &[u8] = b"WAVE";
const FMT_HEADER: &[u8] = b"fmt ";
const DATA_HEADER: &[u8] = b"data";

/// Header size for the layout written here
pub const WAV_HEADER_SIZE: u64 = 44;

/// Bit depth used when none is requested
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 24;

/// Sink for interleaved frames
pub trait FrameWriter {
    /// Append whole frames of `channels` samples each
    fn write_frames(&mut self, interleaved: &[f32], channels: usize) -> Result<(), ExportError>;

    /// Flush and close the output. Idempotent.
    fn finalize(&mut self) -> Result<(), ExportError>;

    fn frames_written(&self) -> u64;
}

fn check_frames(interleaved: &[f32], channels: usize, expected: usize) -> Result<(), ExportError> {
    if channels != expected || (channels > 0 && interleaved.len() % channels != 0) {
        return Err(ExportError::ChannelCountMismatch {
            expected,
            actual: channels,
        });
    }
    Ok(())
}

/// Streaming WAV file writer
pub struct WavWriter {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    frames_written: u64,
    /// Reused conversion buffer
    encoded: Vec<u8>,
}

impl WavWriter {
    /// Create the file and write a placeholder header
    pub fn create<P: AsRef<Path>>(
        path: P,
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    ) -> Result<Self, ExportError> {
        if !matches!(bits_per_sample, 16 | 24 | 32) {
            return Err(ExportError::UnsupportedBitDepth(bits_per_sample));
        }

        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        write_wav_header(&mut writer, sample_rate, channels, bits_per_sample, 0)?;

        info!(
            "Writing {} channels @ {} Hz, {}-bit to {}",
            channels,
            sample_rate,
            bits_per_sample,
            path.display()
        );

        Ok(Self {
            writer: Some(writer),
            path,
            sample_rate,
            channels,
            bits_per_sample,
            frames_written: 0,
            encoded: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finalized(&self) -> bool {
        self.writer.is_none()
    }

    fn bytes_per_frame(&self) -> u64 {
        self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }

    fn data_size(&self) -> Result<u32, ExportError> {
        let size = self.frames_written * self.bytes_per_frame();
        // RIFF size field holds data size + 36
        u32::try_from(size + 36)
            .map(|_| size as u32)
            .map_err(|_| ExportError::FileTooLarge)
    }

    fn encode(&mut self, samples: &[f32]) {
        self.encoded.clear();
        match self.bits_per_sample {
            16 => {
                for &sample in samples {
                    let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                    self.encoded.extend_from_slice(&value.to_le_bytes());
                }
            }
            24 => {
                for &sample in samples {
                    let value = (sample.clamp(-1.0, 1.0) * 8388607.0) as i32;
                    self.encoded.extend_from_slice(&value.to_le_bytes()[0..3]);
                }
            }
            _ => {
                for &sample in samples {
                    self.encoded.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }
    }
}

impl FrameWriter for WavWriter {
    fn write_frames(&mut self, interleaved: &[f32], channels: usize) -> Result<(), ExportError> {
        check_frames(interleaved, channels, self.channels as usize)?;
        if channels == 0 {
            return Ok(());
        }

        let frames = (interleaved.len() / channels) as u64;
        let size = (self.frames_written + frames) * self.bytes_per_frame();
        if size + 36 > u32::MAX as u64 {
            return Err(ExportError::FileTooLarge);
        }

        self.encode(interleaved);
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "WAV writer already finalized")
        })?;
        writer.write_all(&self.encoded)?;

        self.frames_written += frames;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ExportError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let data_size = self.data_size()?;
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        write_wav_header(
            &mut file,
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            data_size,
        )?;
        file.flush()?;

        let duration_secs = self.frames_written as f64 / self.sample_rate.max(1) as f64;
        info!(
            "Finalized {} ({} frames, {:.2}s, {} bytes)",
            self.path.display(),
            self.frames_written,
            duration_secs,
            WAV_HEADER_SIZE + data_size as u64
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

/// Collects frames in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    channels: usize,
    samples: Vec<f32>,
    finalized: bool,
}

impl MemoryWriter {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            ..Default::default()
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Frame `index`, if written
    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.channels)?;
        self.samples.get(start..start + self.channels)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl FrameWriter for MemoryWriter {
    fn write_frames(&mut self, interleaved: &[f32], channels: usize) -> Result<(), ExportError> {
        check_frames(interleaved, channels, self.channels)?;
        self.samples.extend_from_slice(interleaved);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ExportError> {
        self.finalized = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        match self.channels {
            0 => 0,
            channels => (self.samples.len() / channels) as u64,
        }
    }
}

/// Write WAV file header
fn write_wav_header<W: Write>(
    writer: &mut W,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    data_size: u32,
) -> std::io::Result<()> {
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_size;

    // RIFF header
    writer.write_all(RIFF_HEADER)?;
    writer.write_all(&file_size.to_le_bytes())?;
    writer.write_all(WAVE_HEADER)?;

    // fmt subchunk
    writer.write_all(FMT_HEADER)?;
    writer.write_all(&16u32.to_le_bytes())?;
    let format = if bits_per_sample == 32 { 3u16 } else { 1u16 }; // 3 = IEEE float, 1 = PCM
    writer.write_all(&format.to_le_bytes())?;
    writer.write_all(&channels.to_le_bytes())?;
    writer.write_all(&sample_rate.to_le_bytes())?;
    writer.write_all(&byte_rate.to_le_bytes())?;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&bits_per_sample.to_le_bytes())?;

    // data subchunk
    writer.write_all(DATA_HEADER)?;
    writer.write_all(&data_size.to_le_bytes())?;

    Ok(())
}
