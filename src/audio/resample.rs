//! Sample rate conversion using rubato

use super::format::PcmBuffer;
use crate::error::MixError;
use rubato::{FftFixedIn, Resampler};

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Convert every channel of `buffer` to `target_rate`
///
/// The resampler's output delay is trimmed so the result lines up with the
/// input at time zero, and the length is `ceil(frames * target / source)`.
pub fn resample(buffer: &PcmBuffer, target_rate: u32) -> Result<PcmBuffer, MixError> {
    if buffer.sample_rate == target_rate {
        return Ok(buffer.clone());
    }
    if buffer.sample_rate == 0 || target_rate == 0 {
        return Err(MixError::InvalidArgument(format!(
            "cannot resample {} Hz to {} Hz",
            buffer.sample_rate, target_rate
        )));
    }

    let channel_count = buffer.channel_count();
    let frames = buffer.frames();
    if channel_count == 0 || frames == 0 {
        return Ok(PcmBuffer::silent(target_rate, channel_count, 0));
    }

    let mut resampler = FftFixedIn::<f32>::new(
        buffer.sample_rate as usize,
        target_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        channel_count,
    )?;

    let delay = resampler.output_delay();
    let expected =
        (frames as f64 * target_rate as f64 / buffer.sample_rate as f64).ceil() as usize;

    let mut output = vec![Vec::with_capacity(expected + delay + CHUNK_SIZE); channel_count];
    let mut pos = 0;

    // Keep feeding (zero-padded past the end) until the delayed tail is flushed.
    while output[0].len() < expected + delay {
        let needed = resampler.input_frames_next();
        let block: Vec<Vec<f32>> = buffer
            .channels
            .iter()
            .map(|channel| {
                let mut chunk = vec![0.0f32; needed];
                if pos < channel.len() {
                    let n = needed.min(channel.len() - pos);
                    chunk[..n].copy_from_slice(&channel[pos..pos + n]);
                }
                chunk
            })
            .collect();

        let processed = resampler.process(&block, None)?;
        for (dst, src) in output.iter_mut().zip(processed) {
            dst.extend_from_slice(&src);
        }
        pos += needed;
    }

    for channel in &mut output {
        channel.drain(..delay);
        channel.truncate(expected);
    }

    Ok(PcmBuffer::new(target_rate, output))
}
