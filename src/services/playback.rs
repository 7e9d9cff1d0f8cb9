use crate::audio::PcmBuffer;
use crate::error::PlaybackError;
use crate::melody::Melody;
use crate::melody::synth::render_melody;
use rodio::buffer::SamplesBuffer;
use rodio::mixer::Mixer;
use rodio::Sink;

/// Where playback currently is within the loaded melody
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackProgress {
    pub beat: f64,
    pub total_beats: f64,
    pub total_time_ms: f64,
}

/// Guide-melody playback engine
///
/// Lyric timing is derived from the melody itself, never from the engine,
/// so progress here is informational.
pub trait MelodyPlayer {
    fn load(&mut self, melody: &Melody) -> Result<(), PlaybackError>;
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    fn set_volume(&mut self, volume: f32);
    fn progress(&self) -> PlaybackProgress;
    /// Release everything. Idempotent.
    fn dispose(&mut self);
}

struct LoadedMelody {
    pcm: PcmBuffer,
    tempo: f64,
    total_beats: f64,
}

/// Plays a synthesized rendering of the melody on the shared output mixer
pub struct SynthPlayer {
    mixer: Option<Mixer>,
    sample_rate: u32,
    volume: f32,
    loaded: Option<LoadedMelody>,
    sink: Option<Sink>,
}

impl SynthPlayer {
    pub fn new(mixer: Mixer, sample_rate: u32, volume: f32) -> Self {
        Self {
            mixer: Some(mixer),
            sample_rate,
            volume: volume.clamp(0.0, 1.0),
            loaded: None,
            sink: None,
        }
    }
}

impl MelodyPlayer for SynthPlayer {
    fn load(&mut self, melody: &Melody) -> Result<(), PlaybackError> {
        melody
            .validate()
            .map_err(|e| PlaybackError::Load(e.to_string()))?;
        let pcm = render_melody(melody, self.sample_rate);
        tracing::debug!(
            "Rendered guide melody: {:.1}s at {} Hz",
            pcm.duration_seconds(),
            self.sample_rate
        );
        self.loaded = Some(LoadedMelody {
            pcm,
            tempo: melody.tempo,
            total_beats: melody.total_beats(),
        });
        Ok(())
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        let loaded = self.loaded.as_ref().ok_or(PlaybackError::NotLoaded)?;
        let mixer = self
            .mixer
            .as_ref()
            .ok_or_else(|| PlaybackError::Output("player disposed".into()))?;

        if let Some(old) = self.sink.take() {
            old.stop();
        }

        let sink = Sink::connect_new(mixer);
        sink.set_volume(self.volume);
        let samples = loaded.pcm.channels.first().cloned().unwrap_or_default();
        sink.append(SamplesBuffer::new(1, self.sample_rate, samples));
        sink.play();
        self.sink = Some(sink);

        tracing::info!("Guide melody playing");
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            sink.pause();
        }
    }

    fn resume(&mut self) {
        if let Some(sink) = &self.sink {
            sink.play();
        }
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(sink) = &self.sink {
            sink.set_volume(self.volume);
        }
    }

    fn progress(&self) -> PlaybackProgress {
        let Some(loaded) = &self.loaded else {
            return PlaybackProgress::default();
        };
        let position = self.sink.as_ref().map_or(0.0, |s| s.get_pos().as_secs_f64());
        PlaybackProgress {
            beat: (position * loaded.tempo / 60.0).min(loaded.total_beats),
            total_beats: loaded.total_beats,
            total_time_ms: loaded.total_beats * 60_000.0 / loaded.tempo,
        }
    }

    fn dispose(&mut self) {
        self.stop();
        self.loaded = None;
        self.mixer = None;
    }
}
