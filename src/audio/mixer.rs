//! Two-track offline mixing
//!
//! Decodes a primary take and a guide track, aligns both at time zero on a
//! common sample rate and sums them with per-track gain. The shorter track is
//! padded with silence. No limiting happens here; the WAV encoder clamps.

use super::decode::decode_audio;
use super::format::PcmBuffer;
use super::resample::resample;
use super::wav::{BitDepth, encode_wav};
use crate::error::{MixError, MixInput};

/// Per-track linear gain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixGains {
    pub primary: f32,
    pub guide: f32,
}

impl Default for MixGains {
    fn default() -> Self {
        Self {
            primary: 1.0,
            guide: 0.5,
        }
    }
}

impl MixGains {
    pub fn new(primary: f32, guide: f32) -> Self {
        Self { primary, guide }
    }

    fn validate(&self) -> Result<(), MixError> {
        for (name, gain) in [("primary", self.primary), ("guide", self.guide)] {
            if !(0.0..=1.0).contains(&gain) {
                return Err(MixError::InvalidArgument(format!(
                    "{name} gain {gain} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Decode both tracks and mix them at `target_rate`
pub fn combine(
    primary: &[u8],
    guide: &[u8],
    gains: MixGains,
    target_rate: u32,
) -> Result<PcmBuffer, MixError> {
    gains.validate()?;

    let primary = decode_audio(primary).map_err(|source| MixError::Decode {
        input: MixInput::Primary,
        source,
    })?;
    let guide = decode_audio(guide).map_err(|source| MixError::Decode {
        input: MixInput::Guide,
        source,
    })?;

    let primary = resample(&primary, target_rate)?;
    let guide = resample(&guide, target_rate)?;

    tracing::info!(
        "Mixing {:.2}s primary with {:.2}s guide at {} Hz",
        primary.duration_seconds(),
        guide.duration_seconds(),
        target_rate
    );

    Ok(mix_buffers(&primary, &guide, gains))
}

/// Mix both tracks and encode the result as WAV
pub fn combine_to_wav(
    primary: &[u8],
    guide: &[u8],
    gains: MixGains,
    target_rate: u32,
    bit_depth: BitDepth,
) -> Result<Vec<u8>, MixError> {
    let mixed = combine(primary, guide, gains, target_rate)?;
    Ok(encode_wav(&mixed, bit_depth)?)
}

/// Weighted per-sample sum of two buffers already at the same rate
///
/// The output has as many channels as the wider input; a mono input is
/// spread across all output channels.
pub fn mix_buffers(a: &PcmBuffer, b: &PcmBuffer, gains: MixGains) -> PcmBuffer {
    let channel_count = a.channel_count().max(b.channel_count()).max(1);
    let frames = a.frames().max(b.frames());

    let channels = (0..channel_count)
        .map(|c| {
            let src_a = source_channel(a, c);
            let src_b = source_channel(b, c);
            (0..frames)
                .map(|i| sample_at(src_a, i) * gains.primary + sample_at(src_b, i) * gains.guide)
                .collect()
        })
        .collect();

    PcmBuffer::new(a.sample_rate, channels)
}

fn source_channel(buffer: &PcmBuffer, index: usize) -> Option<&[f32]> {
    let last = buffer.channel_count().checked_sub(1)?;
    buffer.channels.get(index.min(last)).map(Vec::as_slice)
}

fn sample_at(channel: Option<&[f32]>, index: usize) -> f32 {
    channel.and_then(|c| c.get(index)).copied().unwrap_or(0.0)
}
