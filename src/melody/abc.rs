//! ABC notation export
//!
//! Unit note length is a quarter (`L:1/4`), so note lengths are written as
//! multiples of a beat quantized to sixteenth notes.

use super::{Melody, Note};
use std::fmt::Write;

/// Quantization grid: 4 steps per quarter note
const STEPS_PER_BEAT: f64 = 4.0;

impl Melody {
    pub fn to_abc(&self) -> String {
        let mut abc = String::new();
        let _ = writeln!(abc, "X:1");
        let _ = writeln!(abc, "T:{}", self.title);
        let _ = writeln!(abc, "M:{}/4", self.beats_per_measure);
        let _ = writeln!(abc, "L:1/4");
        let _ = writeln!(abc, "Q:1/4={}", self.tempo.round() as u32);
        let _ = writeln!(abc, "K:{}", self.key);

        let measure_beats = f64::from(self.beats_per_measure);
        let mut beat_in_measure = 0.0;

        for line in &self.lines {
            let mut music = String::new();
            let mut words = Vec::new();

            for note in &line.notes {
                music.push_str(&note_token(note));

                if !note.is_rest() {
                    words.push(
                        note.syllable
                            .as_deref()
                            .map(escape_syllable)
                            .unwrap_or_else(|| "_".to_string()),
                    );
                }

                beat_in_measure += note.beats;
                if beat_in_measure + 1e-9 >= measure_beats {
                    beat_in_measure -= measure_beats;
                    music.push_str(" |");
                }
                music.push(' ');
            }

            let _ = writeln!(abc, "{}", music.trim_end());
            if !words.is_empty() {
                let _ = writeln!(abc, "w:{}", words.join(" "));
            }
        }

        abc
    }
}

fn note_token(note: &Note) -> String {
    let head = match note.pitch {
        Some(pitch) => pitch_name(pitch),
        None => "z".to_string(),
    };
    format!("{head}{}", length_suffix(note.beats))
}

/// MIDI pitch to ABC: 60 is `C`, 72 is `c`, 48 is `C,`, 84 is `c'`
fn pitch_name(pitch: u8) -> String {
    const NAMES: [(&str, char); 12] = [
        ("", 'C'),
        ("^", 'C'),
        ("", 'D'),
        ("^", 'D'),
        ("", 'E'),
        ("", 'F'),
        ("^", 'F'),
        ("", 'G'),
        ("^", 'G'),
        ("", 'A'),
        ("^", 'A'),
        ("", 'B'),
    ];

    let (accidental, letter) = NAMES[usize::from(pitch % 12)];
    let octave = i32::from(pitch / 12) - 5;

    let mut name = String::from(accidental);
    if octave >= 1 {
        name.push(letter.to_ascii_lowercase());
        name.push_str(&"'".repeat((octave - 1) as usize));
    } else {
        name.push(letter);
        name.push_str(&",".repeat((-octave) as usize));
    }
    name
}

fn length_suffix(beats: f64) -> String {
    let steps = ((beats * STEPS_PER_BEAT).round() as u32).max(1);
    let den = STEPS_PER_BEAT as u32;
    let divisor = gcd(steps, den);
    let (num, den) = (steps / divisor, den / divisor);

    match (num, den) {
        (1, 1) => String::new(),
        (n, 1) => n.to_string(),
        (1, 2) => "/".to_string(),
        (1, d) => format!("/{d}"),
        (n, d) => format!("{n}/{d}"),
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn escape_syllable(text: &str) -> String {
    text.trim().replace(' ', "~").replace('-', "\\-")
}
