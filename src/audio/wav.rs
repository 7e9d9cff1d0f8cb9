//! PCM to WAV encoding
//!
//! Writes the canonical 44-byte RIFF/WAVE header followed by interleaved
//! little-endian PCM. Unlike `hound`, the header layout is identical for every
//! supported depth (no WAVE_FORMAT_EXTENSIBLE), which keeps exported files
//! byte-for-byte predictable.

use crate::audio::format::PcmBuffer;
use crate::error::EncodeError;

pub const HEADER_LEN: usize = 44;

/// Supported PCM bit depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 8-bit unsigned
    Int8,
    /// 16-bit signed (default)
    #[default]
    Int16,
    /// 24-bit signed, packed
    Int24,
    /// 32-bit signed integer
    Int32,
}

impl BitDepth {
    pub fn bits(&self) -> u16 {
        match self {
            BitDepth::Int8 => 8,
            BitDepth::Int16 => 16,
            BitDepth::Int24 => 24,
            BitDepth::Int32 => 32,
        }
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.bits() / 8
    }

    /// Write one sample, clamped to `[-1, 1]`, in little-endian order. NaN
    /// is written as silence.
    ///
    /// Signed depths scale negative values by 2^(n-1) and positive values by
    /// 2^(n-1) - 1 so both full-scale extremes are reachable.
    fn write_sample(&self, out: &mut Vec<u8>, sample: f32) {
        let sample = if sample.is_nan() { 0.0 } else { sample };
        let s = f64::from(sample.clamp(-1.0, 1.0));
        match self {
            BitDepth::Int8 => out.push(((s + 1.0) * 127.5).round() as u8),
            BitDepth::Int16 => {
                let v = scale(s, 32768.0, 32767.0) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            BitDepth::Int24 => {
                let v = scale(s, 8_388_608.0, 8_388_607.0) as i32;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
            BitDepth::Int32 => {
                let v = scale(s, 2_147_483_648.0, 2_147_483_647.0) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = EncodeError;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BitDepth::Int8),
            16 => Ok(BitDepth::Int16),
            24 => Ok(BitDepth::Int24),
            32 => Ok(BitDepth::Int32),
            other => Err(EncodeError::InvalidArgument(format!(
                "unsupported bit depth {other}, expected 8, 16, 24 or 32"
            ))),
        }
    }
}

fn scale(s: f64, negative: f64, positive: f64) -> f64 {
    if s < 0.0 {
        (s * negative).round()
    } else {
        (s * positive).round()
    }
}

/// Encode per-channel float samples as a WAV file in memory
pub fn encode_wav(buffer: &PcmBuffer, bit_depth: BitDepth) -> Result<Vec<u8>, EncodeError> {
    if buffer.channels.is_empty() {
        return Err(EncodeError::InvalidArgument(
            "buffer has no channels".into(),
        ));
    }
    let channel_count = u16::try_from(buffer.channels.len())
        .map_err(|_| EncodeError::InvalidArgument("too many channels".into()))?;

    let frames = buffer.frames();
    if buffer.channels.iter().any(|c| c.len() != frames) {
        return Err(EncodeError::InvalidArgument(
            "channels have different lengths".into(),
        ));
    }

    let block_align = channel_count
        .checked_mul(bit_depth.bytes_per_sample())
        .ok_or_else(|| EncodeError::InvalidArgument("too many channels for WAV".into()))?;
    let byte_rate = buffer
        .sample_rate
        .checked_mul(u32::from(block_align))
        .ok_or_else(|| EncodeError::InvalidArgument("sample rate too high for WAV".into()))?;
    let data_len = u32::try_from(frames as u64 * u64::from(block_align))
        .ok()
        .filter(|len| *len <= u32::MAX - 36)
        .ok_or_else(|| EncodeError::InvalidArgument("audio too long for WAV".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channel_count.to_le_bytes());
    out.extend_from_slice(&buffer.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bit_depth.bits().to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for i in 0..frames {
        for channel in &buffer.channels {
            bit_depth.write_sample(&mut out, channel[i]);
        }
    }

    Ok(out)
}
