use super::Melody;
use crate::audio::PcmBuffer;
use std::f32::consts::TAU;

const ATTACK_SECONDS: f32 = 0.01;
const RELEASE_SECONDS: f32 = 0.04;
const PEAK: f32 = 0.6;

/// Render the melody as a mono guide tone
///
/// Each pitched note is a fundamental plus two soft harmonics with a short
/// linear attack and release; rests are silence. Note boundaries fall on
/// exact sample positions derived from the beat grid, so the rendered length
/// matches `Melody::duration_seconds`.
pub fn render_melody(melody: &Melody, sample_rate: u32) -> PcmBuffer {
    let rate = sample_rate as f64;
    let seconds_per_beat = melody.seconds_per_beat();
    let total = (melody.total_beats() * seconds_per_beat * rate).round() as usize;

    let mut samples = vec![0.0f32; total];
    let mut beat = 0.0;

    for note in melody.notes() {
        let start = (beat * seconds_per_beat * rate).round() as usize;
        beat += note.beats;
        let end = ((beat * seconds_per_beat * rate).round() as usize).min(total);

        let Some(pitch) = note.pitch else { continue };
        let freq = midi_to_hz(pitch);
        let len = end.saturating_sub(start);

        for (i, slot) in samples[start..end].iter_mut().enumerate() {
            let t = i as f32 / sample_rate as f32;
            let phase = TAU * freq * t;
            let tone = phase.sin() + 0.3 * (2.0 * phase).sin() + 0.1 * (3.0 * phase).sin();
            *slot = tone / 1.4 * envelope(i, len, sample_rate) * PEAK;
        }
    }

    PcmBuffer::new(sample_rate, vec![samples])
}

pub fn midi_to_hz(pitch: u8) -> f32 {
    440.0 * 2f32.powf((f32::from(pitch) - 69.0) / 12.0)
}

fn envelope(index: usize, len: usize, sample_rate: u32) -> f32 {
    let attack = (ATTACK_SECONDS * sample_rate as f32).max(1.0);
    let release = (RELEASE_SECONDS * sample_rate as f32).max(1.0);
    let from_end = (len - index) as f32;

    (index as f32 / attack).min(1.0).min(from_end / release)
}
