use super::format::PcmBuffer;
use crate::error::DecodeError;
use rodio::decoder::DecoderError;
use rodio::{Decoder, Source};
use std::io::Cursor;

/// Decode a compressed or containerized audio blob into per-channel PCM
///
/// Accepts whatever the rodio decoders recognize (WAV, FLAC, MP3, Vorbis).
pub fn decode_audio(bytes: &[u8]) -> Result<PcmBuffer, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Corrupt("empty input".into()));
    }

    let decoder = Decoder::new(Cursor::new(bytes.to_vec())).map_err(|e| match e {
        DecoderError::UnrecognizedFormat => DecodeError::UnsupportedFormat(e.to_string()),
        other => DecodeError::Corrupt(other.to_string()),
    })?;

    let channels = decoder.channels() as usize;
    let sample_rate = decoder.sample_rate();
    if channels == 0 || sample_rate == 0 {
        return Err(DecodeError::Corrupt(format!(
            "invalid stream layout ({channels} channels at {sample_rate} Hz)"
        )));
    }

    let interleaved: Vec<f32> = decoder.collect();
    tracing::debug!(
        "Decoded {} samples ({} channels at {} Hz)",
        interleaved.len(),
        channels,
        sample_rate
    );

    Ok(PcmBuffer::from_interleaved(sample_rate, channels, &interleaved))
}
