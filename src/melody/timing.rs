use super::Melody;
use serde::Serialize;

/// When a syllable is sung, in seconds from the start of the melody
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LyricTiming {
    pub line_index: usize,
    pub syllable_index: usize,
    /// Inclusive start
    pub start_time: f64,
    /// Exclusive end
    pub end_time: f64,
    pub text: String,
}

impl LyricTiming {
    pub fn contains(&self, t: f64) -> bool {
        self.start_time <= t && t < self.end_time
    }
}

/// Precomputed syllable timings for one melody at its tempo
///
/// Timings are sorted by start time and never overlap. Rests leave gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LyricTimeline {
    timings: Vec<LyricTiming>,
}

impl LyricTimeline {
    pub fn from_melody(melody: &Melody) -> Self {
        let seconds_per_beat = melody.seconds_per_beat();
        let mut timings: Vec<LyricTiming> = Vec::new();
        let mut beat = 0.0;

        for (line_index, line) in melody.lines.iter().enumerate() {
            let mut syllable_index = 0;
            for note in &line.notes {
                let start_time = beat * seconds_per_beat;
                beat += note.beats;
                let end_time = beat * seconds_per_beat;

                if note.is_rest() {
                    continue;
                }

                match &note.syllable {
                    Some(text) => {
                        timings.push(LyricTiming {
                            line_index,
                            syllable_index,
                            start_time,
                            end_time,
                            text: text.clone(),
                        });
                        syllable_index += 1;
                    }
                    None => {
                        // Melisma: stretch the syllable it continues
                        if let Some(last) = timings.last_mut().filter(|t| {
                            t.line_index == line_index && (t.end_time - start_time).abs() < 1e-9
                        }) {
                            last.end_time = end_time;
                        }
                    }
                }
            }
        }

        Self { timings }
    }

    pub fn timings(&self) -> &[LyricTiming] {
        &self.timings
    }

    /// Timing whose `[start, end)` interval contains `t`
    pub fn timing_at(&self, t: f64) -> Option<&LyricTiming> {
        if !t.is_finite() {
            return None;
        }
        let idx = self.timings.partition_point(|timing| timing.start_time <= t);
        let candidate = self.timings.get(idx.checked_sub(1)?)?;
        candidate.contains(t).then_some(candidate)
    }

    /// Syllable text sung at `t`, if any
    pub fn lyric_at(&self, t: f64) -> Option<&str> {
        self.timing_at(t).map(|timing| timing.text.as_str())
    }
}
