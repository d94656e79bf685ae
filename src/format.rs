//! Stream parameters and PCM sample conversion.
//!
//! A context carries one fixed set of [`StreamParams`]; every player feeds
//! bytes in that format and the mixer decodes them to `f32` inline. No
//! lookup tables, just arithmetic.

use crate::error::{Error, Result};

/// Sample encoding of the input byte stream.
///
/// All formats are little-endian and interleaved by frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit little-endian.
    S16Le,
    /// 32-bit float little-endian.
    F32Le,
}

impl SampleFormat {
    /// Width of one sample of one channel, in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::F32Le => 4,
        }
    }
}

/// Immutable stream parameters shared by the context, mux, and players.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParams {
    sample_rate: u32,
    channel_count: usize,
    format: SampleFormat,
}

impl StreamParams {
    /// Validate and build stream parameters.
    ///
    /// `sample_rate` must be non-zero and `channel_count` must be 1 (mono)
    /// or 2 (stereo).
    pub fn new(sample_rate: u32, channel_count: usize, format: SampleFormat) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::FormatUnsupported(
                "sample rate must be non-zero".to_string(),
            ));
        }
        if channel_count != 1 && channel_count != 2 {
            return Err(Error::FormatUnsupported(format!(
                "channel count must be 1 or 2, got {channel_count}"
            )));
        }
        Ok(Self {
            sample_rate,
            channel_count,
            format,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Size of one interleaved frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.channel_count * self.format.bytes_per_sample()
    }

    /// Default ready-buffer size: half a second of audio, rounded down to a
    /// whole number of frames (never less than one frame).
    pub fn default_buffer_size(&self) -> usize {
        let frame = self.frame_size();
        let half_second = self.sample_rate as usize * frame / 2;
        (half_second / frame * frame).max(frame)
    }

    /// Round a requested buffer size down to a whole number of frames.
    ///
    /// Returns 0 for requests smaller than one frame; callers treat that as
    /// "use the default".
    pub(crate) fn align_buffer_size(&self, size: usize) -> usize {
        let frame = self.frame_size();
        size / frame * frame
    }
}

/// Unsigned 8-bit sample to `f32` in [-1.0, 1.0).
#[inline]
pub(crate) fn decode_u8(byte: u8) -> f32 {
    (byte as i16 - 128) as f32 / 128.0
}

/// Signed 16-bit little-endian sample to `f32` in [-1.0, 1.0).
#[inline]
pub(crate) fn decode_s16le(lo: u8, hi: u8) -> f32 {
    i16::from_le_bytes([lo, hi]) as f32 / 32768.0
}

/// 32-bit float little-endian sample, bit-exact.
#[inline]
pub(crate) fn decode_f32le(bytes: [u8; 4]) -> f32 {
    f32::from_le_bytes(bytes)
}
