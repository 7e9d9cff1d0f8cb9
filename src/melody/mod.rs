pub mod abc;
pub mod synth;
pub mod timing;

pub use timing::{LyricTiming, LyricTimeline};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single note or rest
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Note {
    /// MIDI note number, `None` for a rest
    #[serde(default)]
    pub pitch: Option<u8>,

    /// Length in quarter-note beats
    pub beats: f64,

    /// Syllable sung on this note. A pitched note without one holds the
    /// previous syllable.
    #[serde(default)]
    pub syllable: Option<String>,
}

impl Note {
    pub fn sung(pitch: u8, beats: f64, syllable: &str) -> Self {
        Self {
            pitch: Some(pitch),
            beats,
            syllable: Some(syllable.to_string()),
        }
    }

    pub fn held(pitch: u8, beats: f64) -> Self {
        Self {
            pitch: Some(pitch),
            beats,
            syllable: None,
        }
    }

    pub fn rest(beats: f64) -> Self {
        Self {
            pitch: None,
            beats,
            syllable: None,
        }
    }

    pub fn is_rest(&self) -> bool {
        self.pitch.is_none()
    }
}

/// One lyric line of the poem and the notes it is sung on
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct MelodyLine {
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Melody {
    #[serde(default = "default_title")]
    pub title: String,

    /// Quarter-note beats per minute
    pub tempo: f64,

    #[serde(default = "default_beats_per_measure")]
    pub beats_per_measure: u32,

    #[serde(default = "default_key")]
    pub key: String,

    pub lines: Vec<MelodyLine>,
}

fn default_title() -> String {
    "Untitled".to_string()
}

fn default_beats_per_measure() -> u32 {
    4
}

fn default_key() -> String {
    "C".to_string()
}

impl Melody {
    pub fn new(title: &str, tempo: f64, beats_per_measure: u32, lines: Vec<MelodyLine>) -> Self {
        Self {
            title: title.to_string(),
            tempo,
            beats_per_measure,
            key: default_key(),
            lines,
        }
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let melody: Self = serde_json::from_str(contents).context("Failed to parse melody")?;
        melody.validate()?;
        Ok(melody)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read melody file: {:?}", path))?;
        let melody = Self::from_json(&contents)
            .with_context(|| format!("Invalid melody file: {:?}", path))?;

        tracing::info!(
            "Loaded melody '{}' ({} lines, {:.1}s)",
            melody.title,
            melody.lines.len(),
            melody.duration_seconds()
        );
        Ok(melody)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tempo > 0.0 && self.tempo <= 400.0) {
            return Err(anyhow::anyhow!("tempo must be in (0, 400], got {}", self.tempo));
        }

        if self.beats_per_measure == 0 {
            return Err(anyhow::anyhow!("beats_per_measure must be at least 1"));
        }

        if let Some(note) = self.notes().find(|n| !(n.beats > 0.0 && n.beats.is_finite())) {
            return Err(anyhow::anyhow!("note length must be positive, got {}", note.beats));
        }

        Ok(())
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.lines.iter().flat_map(|line| line.notes.iter())
    }

    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.tempo
    }

    pub fn total_beats(&self) -> f64 {
        self.notes().map(|n| n.beats).sum()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.total_beats() * self.seconds_per_beat()
    }
}
