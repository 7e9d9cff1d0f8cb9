//! Metronome click track
//!
//! One pulse per beat with an accented (higher) pulse on each downbeat. The
//! beat counter survives pause/resume and tempo changes, so downbeats stay
//! aligned with the measure; only `stop` rewinds it.

use crate::error::ClickTrackError;
use rodio::buffer::SamplesBuffer;
use rodio::mixer::Mixer;
use rodio::Source;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const ACCENT_HZ: f32 = 1500.0;
const BEAT_HZ: f32 = 1000.0;
const PULSE_SECONDS: f32 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    /// First beat of a measure
    Accent,
    Beat,
}

/// Where pulses are played
pub trait PulseOutput: Send + Sync {
    fn emit(&self, kind: PulseKind, volume: f32);

    /// The click track using this output was disposed
    fn release(&self) {}
}

/// Pulses rendered once and added to the shared output mixer on demand
pub struct MixerPulseOutput {
    mixer: Mixer,
    sample_rate: u32,
    accent: Vec<f32>,
    beat: Vec<f32>,
}

impl MixerPulseOutput {
    pub fn new(mixer: Mixer, sample_rate: u32) -> Self {
        Self {
            mixer,
            sample_rate,
            accent: render_pulse(sample_rate, ACCENT_HZ),
            beat: render_pulse(sample_rate, BEAT_HZ),
        }
    }
}

impl PulseOutput for MixerPulseOutput {
    fn emit(&self, kind: PulseKind, volume: f32) {
        let samples = match kind {
            PulseKind::Accent => self.accent.clone(),
            PulseKind::Beat => self.beat.clone(),
        };
        let source = SamplesBuffer::new(1, self.sample_rate, samples).amplify(volume);
        self.mixer.add(source);
    }
}

/// Short sine burst with exponential decay
pub fn render_pulse(sample_rate: u32, freq: f32) -> Vec<f32> {
    let len = (sample_rate as f32 * PULSE_SECONDS) as usize;
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let envelope = (-t * 150.0).exp();
            (t * freq * std::f32::consts::TAU).sin() * envelope
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickState {
    Stopped,
    Running,
    Paused,
    Disposed,
}

/// Periodic pulse generator
///
/// The schedule runs as a tokio task; the track itself is a plain value owned
/// by the session.
pub struct ClickTrack {
    output: Option<Arc<dyn PulseOutput>>,
    tempo: f64,
    beats_per_measure: u32,
    volume: Arc<AtomicU32>,
    beat: Arc<AtomicU64>,
    state: ClickState,
    ticker: Option<JoinHandle<()>>,
}

impl ClickTrack {
    pub fn new(
        output: Arc<dyn PulseOutput>,
        tempo: f64,
        beats_per_measure: u32,
        volume: f32,
    ) -> Result<Self, ClickTrackError> {
        validate_tempo(tempo)?;
        Ok(Self {
            output: Some(output),
            tempo,
            beats_per_measure: beats_per_measure.max(1),
            volume: Arc::new(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits())),
            beat: Arc::new(AtomicU64::new(0)),
            state: ClickState::Stopped,
            ticker: None,
        })
    }

    pub fn state(&self) -> ClickState {
        self.state
    }

    /// Beats pulsed since the last `start`
    pub fn beat_count(&self) -> u64 {
        self.beat.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / self.tempo)
    }

    /// First pulse immediately, then one per beat
    pub fn start(&mut self) -> Result<(), ClickTrackError> {
        match self.state {
            ClickState::Disposed => return Err(ClickTrackError::Disposed),
            ClickState::Running => return Ok(()),
            ClickState::Paused => self.cancel_schedule(),
            ClickState::Stopped => {}
        }
        self.beat.store(0, Ordering::SeqCst);
        self.schedule(Instant::now())?;
        self.state = ClickState::Running;
        tracing::debug!("Click track started at {} BPM", self.tempo);
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == ClickState::Running {
            self.cancel_schedule();
            self.state = ClickState::Paused;
        }
    }

    /// Continue counting from where `pause` left off; the next pulse lands
    /// one interval after resuming.
    pub fn resume(&mut self) -> Result<(), ClickTrackError> {
        if self.state != ClickState::Paused {
            return Ok(());
        }
        self.schedule(Instant::now() + self.interval())?;
        self.state = ClickState::Running;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state == ClickState::Disposed {
            return;
        }
        self.cancel_schedule();
        self.beat.store(0, Ordering::SeqCst);
        self.state = ClickState::Stopped;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Change tempo. While running, the schedule restarts at the new
    /// interval (next pulse one new interval from now) and the beat counter
    /// is kept.
    pub fn set_tempo(&mut self, tempo: f64) -> Result<(), ClickTrackError> {
        validate_tempo(tempo)?;
        self.tempo = tempo;
        if self.state == ClickState::Running {
            self.cancel_schedule();
            self.schedule(Instant::now() + self.interval())?;
        }
        Ok(())
    }

    /// Halt pulses and release the output. Idempotent.
    pub fn dispose(&mut self) {
        self.cancel_schedule();
        if let Some(output) = self.output.take() {
            output.release();
        }
        self.state = ClickState::Disposed;
    }

    fn schedule(&mut self, first: Instant) -> Result<(), ClickTrackError> {
        let output = self.output.clone().ok_or(ClickTrackError::Disposed)?;
        let volume = self.volume.clone();
        let beat = self.beat.clone();
        let beats_per_measure = u64::from(self.beats_per_measure);
        let mut ticker = tokio::time::interval_at(first, self.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.ticker = Some(tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let n = beat.fetch_add(1, Ordering::SeqCst);
                let kind = if n % beats_per_measure == 0 {
                    PulseKind::Accent
                } else {
                    PulseKind::Beat
                };
                output.emit(kind, f32::from_bits(volume.load(Ordering::Relaxed)));
            }
        }));
        Ok(())
    }

    fn cancel_schedule(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for ClickTrack {
    fn drop(&mut self) {
        self.cancel_schedule();
    }
}

fn validate_tempo(tempo: f64) -> Result<(), ClickTrackError> {
    if tempo.is_finite() && tempo > 0.0 && tempo <= 400.0 {
        Ok(())
    } else {
        Err(ClickTrackError::InvalidTempo(tempo))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Records every pulse with the (virtual) time it fired
    #[derive(Default)]
    pub(crate) struct RecordingOutput {
        pub pulses: Mutex<Vec<(PulseKind, f32, Instant)>>,
        pub releases: AtomicUsize,
    }

    impl RecordingOutput {
        pub fn kinds(&self) -> Vec<PulseKind> {
            self.pulses.lock().unwrap().iter().map(|p| p.0).collect()
        }

        pub fn count(&self) -> usize {
            self.pulses.lock().unwrap().len()
        }
    }

    impl PulseOutput for RecordingOutput {
        fn emit(&self, kind: PulseKind, volume: f32) {
            self.pulses
                .lock()
                .unwrap()
                .push((kind, volume, Instant::now()));
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn track(tempo: f64, beats: u32) -> (Arc<RecordingOutput>, ClickTrack) {
        let output = Arc::new(RecordingOutput::default());
        let track = ClickTrack::new(output.clone(), tempo, beats, 0.8).unwrap();
        (output, track)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pulse_immediate_then_every_beat() {
        // 120 BPM: one pulse every 500ms
        let (output, mut click) = track(120.0, 4);
        let t0 = Instant::now();
        click.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1600)).await;

        let pulses = output.pulses.lock().unwrap().clone();
        assert_eq!(pulses.len(), 4);
        assert_eq!(pulses[0].2 - t0, Duration::ZERO);
        assert_eq!(pulses[3].2 - t0, Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_downbeat_accent() {
        let (output, mut click) = track(120.0, 3);
        click.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2600)).await;

        assert_eq!(
            output.kinds(),
            vec![
                PulseKind::Accent,
                PulseKind::Beat,
                PulseKind::Beat,
                PulseKind::Accent,
                PulseKind::Beat,
                PulseKind::Beat,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_preserves_beat_alignment() {
        let (output, mut click) = track(120.0, 4);
        click.start().unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        click.pause();
        assert_eq!(click.beat_count(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(output.count(), 2);

        click.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Beats 3 and 4 of the first measure, not a fresh downbeat
        assert_eq!(
            output.kinds(),
            vec![
                PulseKind::Accent,
                PulseKind::Beat,
                PulseKind::Beat,
                PulseKind::Beat,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_resets_counter() {
        let (output, mut click) = track(120.0, 4);
        click.start().unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        click.stop();
        assert_eq!(click.beat_count(), 0);
        assert_eq!(click.state(), ClickState::Stopped);

        click.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output.kinds().last(), Some(&PulseKind::Accent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_tempo_keeps_counter_and_new_interval() {
        let (output, mut click) = track(120.0, 4);
        click.start().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(output.count(), 2);

        let changed_at = Instant::now();
        click.set_tempo(60.0).unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let pulses = output.pulses.lock().unwrap().clone();
        assert_eq!(pulses.len(), 4);
        assert_eq!(pulses[2].2 - changed_at, Duration::from_secs(1));
        assert_eq!(pulses[3].2 - changed_at, Duration::from_secs(2));
        assert_eq!(pulses[2].0, PulseKind::Beat);
        assert_eq!(click.beat_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_applies_to_next_pulse() {
        let (output, mut click) = track(120.0, 4);
        click.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        click.set_volume(0.25);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let pulses = output.pulses.lock().unwrap().clone();
        assert_eq!(pulses[0].1, 0.8);
        assert_eq!(pulses[1].1, 0.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_halts_and_rejects_start() {
        let (output, mut click) = track(120.0, 4);
        click.start().unwrap();
        click.dispose();
        click.dispose();
        let before = output.count();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(output.count(), before);
        assert_eq!(click.start(), Err(ClickTrackError::Disposed));
        assert_eq!(output.releases.load(Ordering::SeqCst), 1);
        // Only the test's handle is left once the track drops its output
        assert_eq!(Arc::strong_count(&output), 1);
    }

    #[test]
    fn test_invalid_tempo() {
        let output = Arc::new(RecordingOutput::default());
        assert!(ClickTrack::new(output, 0.0, 4, 0.5).is_err());
    }

    #[test]
    fn test_accent_pulse_is_distinct() {
        let accent = render_pulse(44100, ACCENT_HZ);
        let beat = render_pulse(44100, BEAT_HZ);
        assert_eq!(accent.len(), beat.len());
        assert_ne!(accent, beat);
        assert!(accent.iter().all(|s| s.abs() <= 1.0));
    }
}
