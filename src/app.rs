use crate::audio::mixer::{MixGains, combine_to_wav};
use crate::audio::{AudioFormat, AudioGraph, CpalMicrophone};
use crate::config::Config;
use crate::export::{self, ExportFormat};
use crate::hooks;
use crate::melody::Melody;
use crate::messages::{SessionEvent, SyncSessionState};
use crate::services::{
    MixerPulseOutput, SessionConfig, SessionDeps, SessionHandle, SyncSession, SyncSessionResult,
    SynthPlayer,
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// A line typed at the record prompt
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Start,
    Pause,
    Resume,
    Stop,
    GuideVolume(f32),
    Click(bool),
    ClickVolume(f32),
    Tempo(f64),
    Quit,
}

impl std::str::FromStr for UserCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let arg = words.next();

        let number = |what: &str| -> Result<f64, String> {
            arg.ok_or_else(|| format!("{verb} needs a {what}"))?
                .parse::<f64>()
                .map_err(|e| format!("bad {what}: {e}"))
        };

        match verb.as_str() {
            "start" => Ok(UserCommand::Start),
            "pause" => Ok(UserCommand::Pause),
            "resume" => Ok(UserCommand::Resume),
            "stop" => Ok(UserCommand::Stop),
            "quit" | "exit" => Ok(UserCommand::Quit),
            "guide" => Ok(UserCommand::GuideVolume(number("volume")? as f32)),
            "clickvol" => Ok(UserCommand::ClickVolume(number("volume")? as f32)),
            "tempo" => Ok(UserCommand::Tempo(number("tempo")?)),
            "click" => match arg {
                Some("on") => Ok(UserCommand::Click(true)),
                Some("off") => Ok(UserCommand::Click(false)),
                _ => Err("click takes on|off".to_string()),
            },
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Interactive recording of takes against one melody
pub struct App {
    config: Config,
    melody: Melody,
    take: Option<u32>,
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Latest recorded duration, for reporting where a pause landed
    position: f64,
}

impl App {
    /// Must run inside a LocalSet
    pub async fn new(config: Config, melody: Melody, take: Option<u32>) -> Result<Self> {
        let (session, events) = Self::open_session(&config, &melody).await?;

        tracing::info!(
            "Ready to record '{}' ({:.1}s at {} BPM). Type 'start' to begin.",
            melody.title,
            melody.duration_seconds(),
            melody.tempo
        );

        Ok(Self {
            config,
            melody,
            take,
            session,
            events,
            position: 0.0,
        })
    }

    /// Open audio devices and wait for a new session to become ready
    async fn open_session(
        config: &Config,
        melody: &Melody,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        let graph = AudioGraph::open_default()?;
        let mixer = graph.mixer().clone();
        let format = AudioFormat::new(config.sample_rate, 1);

        let deps = SessionDeps {
            microphone: Box::new(CpalMicrophone::new(format)),
            player: Box::new(SynthPlayer::new(
                mixer.clone(),
                config.sample_rate,
                config.guide_volume,
            )),
            pulse_output: Arc::new(MixerPulseOutput::new(mixer, config.sample_rate)),
            graph: Some(graph),
        };

        let (session, events) =
            SyncSession::spawn(melody.clone(), SessionConfig::from(config), deps);
        session
            .ready()
            .await
            .context("Recording session failed to initialize")?;
        Ok((session, events))
    }

    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read stdin")? else {
                        tracing::debug!("stdin closed");
                        break;
                    };
                    match line.parse::<UserCommand>() {
                        Ok(UserCommand::Quit) => break,
                        Ok(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                tracing::error!("Error handling command: {:#}", e);
                            }
                        }
                        Err(e) => tracing::warn!("{}", e),
                    }
                }

                Some(event) = self.events.recv() => self.handle_event(event),

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.session.dispose().await;
        tracing::info!("Ghostnote shutdown complete");
        Ok(())
    }

    async fn handle_command(&mut self, cmd: UserCommand) -> Result<()> {
        tracing::debug!("handle_command: {:?}", cmd);

        let outcome = match cmd {
            UserCommand::Start => self.session.start().await,
            UserCommand::Pause => self.session.pause().await,
            UserCommand::Resume => self.session.resume().await,
            UserCommand::Stop => {
                match self.session.stop().await {
                    Ok(result) => self.save_take(&result),
                    Err(e) => tracing::warn!("Nothing exported: {}", e),
                }
                Ok(())
            }
            UserCommand::GuideVolume(v) => self.session.set_guide_volume(v).await,
            UserCommand::Click(enabled) => self.session.set_click_track_enabled(enabled).await,
            UserCommand::ClickVolume(v) => self.session.set_click_volume(v).await,
            UserCommand::Tempo(bpm) => self.session.set_tempo(bpm).await,
            UserCommand::Quit => Ok(()),
        };

        // A finished or failed session cannot record again
        if is_spent(self.session.state()) {
            self.next_session().await?;
        }

        Ok(outcome?)
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CountdownTick(n) => tracing::info!("{}...", n),
            SessionEvent::StateChanged(SyncSessionState::Recording) => {
                tracing::info!("Recording. Type 'pause' or 'stop'.")
            }
            SessionEvent::StateChanged(SyncSessionState::Paused) => {
                match self.session.lyric_timing_for_position(self.position) {
                    Some(timing) => tracing::info!(
                        "Paused on line {} at '{}'. Type 'resume' or 'stop'.",
                        timing.line_index + 1,
                        timing.text
                    ),
                    None => tracing::info!("Paused. Type 'resume' or 'stop'."),
                }
            }
            SessionEvent::StateChanged(state) => tracing::debug!("Session is {:?}", state),
            SessionEvent::DurationUpdated(seconds) => {
                self.position = seconds;
                let lyric = self.session.lyric_for_position(seconds).unwrap_or("");
                tracing::info!("[{:>6.1}s] {}", seconds, lyric);
            }
            SessionEvent::Failed { component, message } => match component {
                Some(component) => tracing::error!("{} failed: {}", component, message),
                None => tracing::error!("Session failed: {}", message),
            },
        }
    }

    fn save_take(&mut self, result: &SyncSessionResult) {
        let date = chrono::Local::now().date_naive();
        match export_take(&self.config, &self.melody, self.take, result, date) {
            Ok(files) => {
                for path in &files {
                    self.after_export(path);
                }
                tracing::info!(
                    "Take saved: {:?} ({:.1}s, {} syllables)",
                    files.first(),
                    result.duration_seconds,
                    result.timings.len()
                );
            }
            Err(e) => tracing::error!("Take export failed: {:#}", e),
        }
        self.take = Some(self.take.map_or(2, |n| n + 1));
    }

    /// Replace a completed or failed session with a fresh one
    async fn next_session(&mut self) -> Result<()> {
        self.session.dispose().await;
        let (session, events) = Self::open_session(&self.config, &self.melody).await?;
        self.session = session;
        self.events = events;
        self.position = 0.0;

        tracing::info!("Ready for the next take. Type 'start' to begin.");
        Ok(())
    }

    fn after_export(&self, path: &std::path::Path) {
        if let Some(hook) = &self.config.post_export_hook {
            // Detached: the hook may outlive this take
            let _ = hooks::run_export_hook(hook, path);
        }
    }
}

/// Completed and Error are terminal; another take needs a new session
fn is_spent(state: SyncSessionState) -> bool {
    matches!(state, SyncSessionState::Completed | SyncSessionState::Error)
}

/// Write the take, its notation and optionally a guide mix to the output
/// directory. Returns the written paths, take audio first.
///
/// The recorded audio is never dropped: a failed re-encode keeps the bytes as
/// recorded, and an unwritable output directory falls back to the temp dir.
pub fn export_take(
    config: &Config,
    melody: &Melody,
    take: Option<u32>,
    result: &SyncSessionResult,
    date: NaiveDate,
) -> Result<Vec<PathBuf>> {
    let format =
        ExportFormat::from_mime(&result.recording.mime_type).unwrap_or(ExportFormat::Wav);
    let audio = match format {
        ExportFormat::Wav => match config
            .bit_depth()
            .and_then(|depth| Ok(export::convert_to_wav(&result.recording, depth)?))
        {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!("Keeping the take as recorded: {:#}", e);
                result.recording.audio.clone()
            }
        },
        ExportFormat::Webm => result.recording.audio.clone(),
    };

    let filename = export::generate_filename(Some(&result.title), take, format, date);
    let take_path = match export::save_export(&config.output_dir, &filename, &audio) {
        Ok(path) => path,
        Err(e) => {
            let fallback = std::env::temp_dir();
            tracing::error!("{}; saving the take to {:?} instead", e, fallback);
            export::save_export(&fallback, &filename, &audio)
                .context("Take could not be saved anywhere")?
        }
    };
    let mut files = vec![take_path.clone()];

    let abc_path = take_path.with_extension("abc");
    match std::fs::write(&abc_path, &result.abc_notation) {
        Ok(()) => files.push(abc_path),
        Err(e) => tracing::warn!("Failed to write notation {:?}: {}", abc_path, e),
    }

    if config.mix_guide_on_export {
        match export_mix(config, melody, take, result, &audio, date) {
            Ok(path) => files.push(path),
            Err(e) => tracing::warn!("Guide mix not exported: {:#}", e),
        }
    }

    Ok(files)
}

fn export_mix(
    config: &Config,
    melody: &Melody,
    take: Option<u32>,
    result: &SyncSessionResult,
    take_audio: &[u8],
    date: NaiveDate,
) -> Result<PathBuf> {
    let bit_depth = config.bit_depth()?;
    let guide = export::render_guide_wav(melody, config.sample_rate, bit_depth)?;
    let gains = MixGains::new(config.primary_gain, config.guide_gain);
    let mixed = combine_to_wav(take_audio, &guide, gains, config.sample_rate, bit_depth)?;

    let title = format!("{} with guide", result.title);
    let filename = export::generate_filename(Some(&title), take, ExportFormat::Wav, date);
    Ok(export::save_export(&config.output_dir, &filename, &mixed)?)
}
