use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{PipelineError, PipelineResult};

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u16 = 2;
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;
pub const DEFAULT_FRAME_DURATION_MS: u32 = 20;

/// Shape of one playback tick of interleaved PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameGeometry {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_duration_ms: u32,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
        }
    }
}

impl FrameGeometry {
    pub fn with_frame_duration_ms(mut self, frame_duration_ms: u32) -> Self {
        self.frame_duration_ms = frame_duration_ms;
        self
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.frame_duration_ms == 0 {
            return Err(PipelineError::invalid_frame(format!(
                "geometry fields must be non-zero: {:?}",
                self
            )));
        }
        if self.bits_per_sample != 16 {
            return Err(PipelineError::invalid_frame(format!(
                "only 16-bit samples are supported, got {}",
                self.bits_per_sample
            )));
        }
        if (self.sample_rate as u64 * self.frame_duration_ms as u64) % 1000 != 0 {
            return Err(PipelineError::invalid_frame(format!(
                "{} ms at {} Hz is not a whole number of samples",
                self.frame_duration_ms, self.sample_rate
            )));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    pub fn samples_per_channel(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
    }

    /// Interleaved sample count of one frame (all channels).
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_channel() * self.channels as usize
    }

    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.bytes_per_sample()
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// One immutable, exactly frame-sized slice of s16le PCM.
///
/// There is no way to build a short frame: [`AudioFrame::new`] rejects any
/// buffer whose length differs from the geometry's frame size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    seq: u64,
    utc_ns: u64,
    data: Bytes,
}

impl AudioFrame {
    pub fn new(
        geometry: &FrameGeometry,
        seq: u64,
        utc_ns: u64,
        data: impl Into<Bytes>,
    ) -> PipelineResult<Self> {
        let data = data.into();
        let expected = geometry.frame_bytes();
        if data.len() != expected {
            return Err(PipelineError::invalid_frame(format!(
                "frame {} has {} bytes, expected {}",
                seq,
                data.len(),
                expected
            )));
        }
        Ok(Self { seq, utc_ns, data })
    }

    /// Source order, starting at 1 for the first frame read.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn utc_ns(&self) -> u64 {
        self.utc_ns
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Absolute peak over all channels, 0.0..=1.0.
    pub fn peak(&self) -> f32 {
        self.data
            .chunks_exact(2)
            .map(|b| LittleEndian::read_i16(b).unsigned_abs())
            .max()
            .map(|p| p as f32 / i16::MAX as f32)
            .unwrap_or(0.0)
            .min(1.0)
    }
}
