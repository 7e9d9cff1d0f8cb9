//! Synced recording session
//!
//! Plays the melody as a guide track while recording the microphone, with an
//! optional click track. The session is an actor: every external input (a
//! command, a countdown deadline, a recorder notification) is a message that
//! drives one transition of the state machine.
//!
//! ```text
//! Idle -> Initializing -> Ready -> Countdown -> Recording <-> Paused -> Stopping -> Completed
//!                           ^          |
//!                           +- stop() -+          (any) -> Error on unrecoverable failure
//! ```

use super::click_track::{ClickState, ClickTrack, PulseOutput};
use super::playback::MelodyPlayer;
use super::recorder::{Recorder, RecorderHandle, RecordingResult};
use crate::audio::{AudioGraph, MicrophoneProvider, MicrophoneStream};
use crate::config::Config;
use crate::error::{RecorderError, SessionComponent, SessionError};
use crate::melody::{LyricTiming, LyricTimeline, Melody};
use crate::messages::{
    RecorderEvent, SessionCommand, SessionEvent, SessionSnapshot, SyncSessionState,
};
use futures::future::OptionFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

/// Session behavior knobs, usually taken from `Config`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub countdown_seconds: u32,
    pub click_track_enabled: bool,
    pub click_volume: f32,
    pub guide_volume: f32,
    pub input_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            countdown_seconds: 3,
            click_track_enabled: true,
            click_volume: 0.5,
            guide_volume: 0.7,
            input_device: None,
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            countdown_seconds: config.countdown_seconds,
            click_track_enabled: config.click_track_enabled,
            click_volume: config.click_volume,
            guide_volume: config.guide_volume,
            input_device: config.input_device.clone(),
        }
    }
}

/// Platform collaborators handed to a session. The session owns them
/// exclusively until it is disposed.
pub struct SessionDeps {
    pub microphone: Box<dyn MicrophoneProvider>,
    pub player: Box<dyn MelodyPlayer>,
    pub pulse_output: Arc<dyn PulseOutput>,
    pub graph: Option<AudioGraph>,
}

/// Everything produced by one completed take
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSessionResult {
    pub recording: RecordingResult,
    pub title: String,
    pub abc_notation: String,
    pub timings: Vec<LyricTiming>,
    pub duration_seconds: f64,
}

/// Acquired resources, released in reverse order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    AudioGraph,
    Microphone,
    Recorder,
    Playback,
    ClickTrack,
}

struct Countdown {
    remaining: u32,
    deadline: Instant,
}

/// Orchestrates recorder, click track and melody playback
///
/// Note: The session holds the microphone stream and audio output, which are
/// !Send, so it must be spawned on a LocalSet.
pub struct SyncSession {
    melody: Melody,
    config: SessionConfig,
    timeline: Arc<LyricTimeline>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
    microphone: Box<dyn MicrophoneProvider>,
    player: Box<dyn MelodyPlayer>,
    pulse_output: Arc<dyn PulseOutput>,
    graph: Option<AudioGraph>,
    mic_stream: Option<MicrophoneStream>,
    recorder: Option<RecorderHandle>,
    recorder_events: Option<mpsc::UnboundedReceiver<RecorderEvent>>,
    click: Option<ClickTrack>,
    countdown: Option<Countdown>,
    acquired: Vec<Resource>,
    state: SyncSessionState,
}

impl SyncSession {
    /// Spawn the session on the current LocalSet. Initialization (microphone,
    /// playback preparation) runs in the background; await
    /// `SessionHandle::ready` for its outcome.
    pub fn spawn(
        melody: Melody,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let timeline = Arc::new(LyricTimeline::from_melody(&melody));
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SyncSessionState::Idle,
            error: None,
        });

        let session = Self {
            melody,
            config,
            timeline: timeline.clone(),
            cmd_rx,
            snapshot: snapshot_tx,
            events: event_tx,
            microphone: deps.microphone,
            player: deps.player,
            pulse_output: deps.pulse_output,
            graph: deps.graph,
            mic_stream: None,
            recorder: None,
            recorder_events: None,
            click: None,
            countdown: None,
            acquired: Vec::new(),
            state: SyncSessionState::Idle,
        };
        tokio::task::spawn_local(session.run());

        let handle = SessionHandle {
            tx: cmd_tx,
            snapshot: snapshot_rx,
            timeline,
        };
        (handle, event_rx)
    }

    async fn run(mut self) {
        self.initialize().await;

        loop {
            let countdown_due = OptionFuture::from(
                self.countdown
                    .as_ref()
                    .map(|c| tokio::time::sleep_until(c.deadline)),
            );

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(()) = countdown_due => self.on_countdown_tick().await,

                Some(event) = next_recorder_event(&mut self.recorder_events) => {
                    self.on_recorder_event(event);
                }
            }
        }

        // Every handle is gone: nothing can call dispose any more
        self.dispose().await;
        tracing::debug!("Session service exited");
    }

    async fn initialize(&mut self) {
        self.set_state(SyncSessionState::Initializing);

        if self.graph.is_some() {
            self.acquired.push(Resource::AudioGraph);
        }

        if let Err(e) = self.melody.validate() {
            self.fail(None, format!("Invalid melody '{}': {}", self.melody.title, e))
                .await;
            return;
        }

        let access = self
            .microphone
            .request_access(self.config.input_device.as_deref())
            .await;
        match access {
            Ok(stream) => {
                let format = stream.format();
                tracing::info!(
                    "Microphone open: {} Hz, {} channel(s)",
                    format.sample_rate,
                    format.channels
                );
                self.mic_stream = Some(stream);
                self.acquired.push(Resource::Microphone);
            }
            Err(e) => {
                tracing::error!(
                    "Microphone unavailable ({:?}): {}",
                    e.permission_state(),
                    e
                );
                self.fail(Some(SessionComponent::Microphone), e.to_string())
                    .await;
                return;
            }
        }

        let (recorder, recorder_events) = Recorder::spawn();
        self.recorder = Some(recorder);
        self.recorder_events = Some(recorder_events);
        self.acquired.push(Resource::Recorder);

        if let Err(e) = self.player.load(&self.melody) {
            self.fail(Some(SessionComponent::Playback), e.to_string())
                .await;
            return;
        }
        self.player.set_volume(self.config.guide_volume);
        self.acquired.push(Resource::Playback);

        match ClickTrack::new(
            self.pulse_output.clone(),
            self.melody.tempo,
            self.melody.beats_per_measure,
            self.config.click_volume,
        ) {
            Ok(click) => {
                self.click = Some(click);
                self.acquired.push(Resource::ClickTrack);
            }
            Err(e) => {
                self.fail(Some(SessionComponent::ClickTrack), e.to_string())
                    .await;
                return;
            }
        }

        tracing::info!(
            "Session ready: '{}' ({} syllables)",
            self.melody.title,
            self.timeline.timings().len()
        );
        self.set_state(SyncSessionState::Ready);
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            SessionCommand::Pause(reply) => {
                self.pause().await;
                let _ = reply.send(());
            }
            SessionCommand::Resume(reply) => {
                self.resume().await;
                let _ = reply.send(());
            }
            SessionCommand::Stop(reply) => {
                let _ = reply.send(self.stop().await);
            }
            SessionCommand::Duration(reply) => {
                let duration = match &self.recorder {
                    Some(recorder) => recorder.duration().await.unwrap_or(0.0),
                    None => 0.0,
                };
                let _ = reply.send(duration);
            }
            SessionCommand::SetGuideVolume(volume) => {
                self.config.guide_volume = volume.clamp(0.0, 1.0);
                self.player.set_volume(self.config.guide_volume);
            }
            SessionCommand::SetClickTrackEnabled(enabled) => {
                self.set_click_track_enabled(enabled);
            }
            SessionCommand::SetClickVolume(volume) => {
                self.config.click_volume = volume.clamp(0.0, 1.0);
                if let Some(click) = self.click.as_mut() {
                    click.set_volume(self.config.click_volume);
                }
            }
            SessionCommand::SetClickTempo(tempo) => {
                if let Some(click) = self.click.as_mut() {
                    if let Err(e) = click.set_tempo(tempo) {
                        tracing::warn!("Ignoring click tempo change: {}", e);
                    }
                }
            }
            SessionCommand::Dispose(reply) => {
                self.dispose().await;
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SyncSessionState::Ready => {
                let seconds = self.config.countdown_seconds;
                if seconds == 0 {
                    return self.begin_recording().await;
                }
                self.set_state(SyncSessionState::Countdown);
                self.emit(SessionEvent::CountdownTick(seconds));
                self.countdown = Some(Countdown {
                    remaining: seconds,
                    deadline: Instant::now() + COUNTDOWN_STEP,
                });
                tracing::info!("Countdown started ({}s)", seconds);
                Ok(())
            }
            SyncSessionState::Paused => {
                self.resume().await;
                Ok(())
            }
            SyncSessionState::Countdown | SyncSessionState::Recording => {
                tracing::debug!("Start ignored while {:?}", self.state);
                Ok(())
            }
            state => Err(SessionError::InvalidState {
                operation: "start",
                state,
            }),
        }
    }

    async fn on_countdown_tick(&mut self) {
        let Some(countdown) = self.countdown.as_mut() else {
            return;
        };
        countdown.remaining = countdown.remaining.saturating_sub(1);

        if countdown.remaining > 0 {
            countdown.deadline += COUNTDOWN_STEP;
            let remaining = countdown.remaining;
            self.emit(SessionEvent::CountdownTick(remaining));
            return;
        }

        self.countdown = None;
        if let Err(e) = self.begin_recording().await {
            tracing::error!("Recording did not start: {}", e);
        }
    }

    /// Start recorder, click track and guide playback, in that order. Any
    /// failure rolls back what already started and fails the session.
    async fn begin_recording(&mut self) -> Result<(), SessionError> {
        let input = self.mic_stream.as_ref().map(MicrophoneStream::input);
        let (Some(recorder), Some(input)) = (self.recorder.clone(), input) else {
            return Err(self
                .fail(Some(SessionComponent::Recorder), "recorder not available".into())
                .await);
        };

        if let Err(e) = recorder.start(input).await {
            return Err(self
                .fail(Some(SessionComponent::Recorder), e.to_string())
                .await);
        }

        if self.config.click_track_enabled {
            let started = match self.click.as_mut() {
                Some(click) => click.start().map_err(|e| e.to_string()),
                None => Err("click track not available".to_string()),
            };
            if let Err(message) = started {
                recorder.dispose().await;
                return Err(self.fail(Some(SessionComponent::ClickTrack), message).await);
            }
        }

        if let Err(e) = self.player.play() {
            if let Some(click) = self.click.as_mut() {
                click.stop();
            }
            recorder.dispose().await;
            return Err(self
                .fail(Some(SessionComponent::Playback), e.to_string())
                .await);
        }

        self.set_state(SyncSessionState::Recording);
        tracing::info!("Recording '{}'", self.melody.title);
        Ok(())
    }

    async fn pause(&mut self) {
        if self.state != SyncSessionState::Recording {
            tracing::warn!("Pause ignored while {:?}", self.state);
            return;
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.pause().await {
                self.fail(Some(SessionComponent::Recorder), e.to_string())
                    .await;
                return;
            }
        }
        if let Some(click) = self.click.as_mut() {
            click.pause();
        }
        self.player.pause();
        self.set_state(SyncSessionState::Paused);
    }

    async fn resume(&mut self) {
        if self.state != SyncSessionState::Paused {
            tracing::warn!("Resume ignored while {:?}", self.state);
            return;
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.resume().await {
                self.fail(Some(SessionComponent::Recorder), e.to_string())
                    .await;
                return;
            }
        }
        if self.config.click_track_enabled {
            if let Some(click) = self.click.as_mut() {
                let resumed = match click.state() {
                    ClickState::Paused => click.resume(),
                    ClickState::Stopped => click.start(),
                    _ => Ok(()),
                };
                if let Err(e) = resumed {
                    tracing::warn!("Click track did not resume: {}", e);
                }
            }
        }
        self.player.resume();
        self.set_state(SyncSessionState::Recording);
    }

    async fn stop(&mut self) -> Result<SyncSessionResult, SessionError> {
        match self.state {
            SyncSessionState::Countdown => {
                // Nothing was started yet, so there is nothing to halt
                self.countdown = None;
                tracing::info!("Countdown cancelled");
                self.set_state(SyncSessionState::Stopping);
                self.set_state(SyncSessionState::Completed);
                return Err(SessionError::NoRecordingData);
            }
            SyncSessionState::Recording | SyncSessionState::Paused => {}
            state => {
                tracing::warn!("Stop ignored while {:?}", state);
                return Err(SessionError::NoRecordingData);
            }
        }

        self.set_state(SyncSessionState::Stopping);
        if let Some(click) = self.click.as_mut() {
            click.stop();
        }
        self.player.stop();

        let Some(recorder) = self.recorder.clone() else {
            return Err(self
                .fail(Some(SessionComponent::Recorder), "recorder not available".into())
                .await);
        };

        let recording = match recorder.stop().await {
            Ok(recording) => recording,
            Err(RecorderError::NotRecording) => {
                self.set_state(SyncSessionState::Completed);
                return Err(SessionError::NoRecordingData);
            }
            Err(e) => {
                return Err(self
                    .fail(Some(SessionComponent::Recorder), e.to_string())
                    .await);
            }
        };

        self.set_state(SyncSessionState::Completed);
        if recording.frames == 0 {
            tracing::warn!("Recording finished without any captured audio");
            return Err(SessionError::NoRecordingData);
        }

        Ok(SyncSessionResult {
            duration_seconds: recording.duration_seconds,
            recording,
            title: self.melody.title.clone(),
            abc_notation: self.melody.to_abc(),
            timings: self.timeline.timings().to_vec(),
        })
    }

    fn set_click_track_enabled(&mut self, enabled: bool) {
        self.config.click_track_enabled = enabled;
        let Some(click) = self.click.as_mut() else {
            return;
        };

        match (self.state, enabled) {
            (SyncSessionState::Recording, true) => {
                if let Err(e) = click.start() {
                    tracing::warn!("Click track did not start: {}", e);
                }
            }
            (SyncSessionState::Recording | SyncSessionState::Paused, false) => click.stop(),
            _ => {}
        }
    }

    fn on_recorder_event(&mut self, event: RecorderEvent) {
        match event {
            RecorderEvent::DurationUpdated(seconds) => {
                self.emit(SessionEvent::DurationUpdated(seconds));
            }
            RecorderEvent::StateChanged(state) => {
                tracing::debug!("Recorder is now {:?}", state);
            }
        }
    }

    /// Enter the terminal error state and release everything held
    async fn fail(&mut self, component: Option<SessionComponent>, message: String) -> SessionError {
        let error = match component {
            Some(component) if self.state != SyncSessionState::Initializing => {
                SessionError::PartialStart {
                    component,
                    message: message.clone(),
                }
            }
            _ => SessionError::Initialization(message.clone()),
        };
        tracing::error!("Session failed: {}", error);

        self.countdown = None;
        self.release_all().await;

        self.state = SyncSessionState::Error;
        self.snapshot.send_replace(SessionSnapshot {
            state: SyncSessionState::Error,
            error: Some(message.clone()),
        });
        self.emit(SessionEvent::StateChanged(SyncSessionState::Error));
        self.emit(SessionEvent::Failed { component, message });
        error
    }

    /// Cancel timers and release every resource, then go idle. Safe to call
    /// repeatedly and from any state.
    async fn dispose(&mut self) {
        self.countdown = None;
        self.release_all().await;
        self.set_state(SyncSessionState::Idle);
    }

    async fn release_all(&mut self) {
        while let Some(resource) = self.acquired.pop() {
            match resource {
                Resource::ClickTrack => {
                    if let Some(mut click) = self.click.take() {
                        click.dispose();
                    }
                }
                Resource::Playback => self.player.dispose(),
                Resource::Recorder => {
                    if let Some(recorder) = self.recorder.take() {
                        recorder.dispose().await;
                    }
                    self.recorder_events = None;
                }
                Resource::Microphone => {
                    if let Some(stream) = self.mic_stream.take() {
                        self.microphone.stop_stream(stream);
                    }
                }
                Resource::AudioGraph => {
                    if let Some(mut graph) = self.graph.take() {
                        graph.close();
                    }
                }
            }
            tracing::debug!("Released {:?}", resource);
        }
    }

    fn set_state(&mut self, state: SyncSessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.snapshot.send_replace(SessionSnapshot { state, error: None });
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_recorder_event(
    events: &mut Option<mpsc::UnboundedReceiver<RecorderEvent>>,
) -> Option<RecorderEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle for communicating with a SyncSession
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    timeline: Arc<LyricTimeline>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(cmd).await.map_err(|_| SessionError::Closed)
    }

    /// Wait for initialization to finish
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(|s| {
                !matches!(
                    s.state,
                    SyncSessionState::Idle | SyncSessionState::Initializing
                )
            })
            .await
            .map_err(|_| SessionError::Closed)?
            .clone();

        match snapshot.state {
            SyncSessionState::Error => Err(SessionError::Initialization(
                snapshot.error.unwrap_or_default(),
            )),
            _ => Ok(()),
        }
    }

    /// Begin the countdown (or resume when paused)
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Start).await?
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Resume).await
    }

    /// Finish the take; cancels a pending countdown
    pub async fn stop(&self) -> Result<SyncSessionResult, SessionError> {
        self.request(SessionCommand::Stop).await?
    }

    pub async fn duration(&self) -> Result<f64, SessionError> {
        self.request(SessionCommand::Duration).await
    }

    pub async fn set_guide_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.send(SessionCommand::SetGuideVolume(volume)).await
    }

    pub async fn set_click_track_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetClickTrackEnabled(enabled))
            .await
    }

    pub async fn set_click_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.send(SessionCommand::SetClickVolume(volume)).await
    }

    pub async fn set_tempo(&self, tempo: f64) -> Result<(), SessionError> {
        self.send(SessionCommand::SetClickTempo(tempo)).await
    }

    /// Release everything. Succeeds even if the session already exited.
    pub async fn dispose(&self) {
        if self.request(SessionCommand::Dispose).await.is_err() {
            tracing::debug!("Session already gone during dispose");
        }
    }

    pub fn state(&self) -> SyncSessionState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn timings(&self) -> &[LyricTiming] {
        self.timeline.timings()
    }

    pub fn lyric_for_position(&self, seconds: f64) -> Option<&str> {
        self.timeline.lyric_at(seconds)
    }

    pub fn lyric_timing_for_position(&self, seconds: f64) -> Option<&LyricTiming> {
        self.timeline.timing_at(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::error::{MicrophoneError, PermissionState, PlaybackError};
    use crate::melody::{MelodyLine, Note};
    use crate::services::click_track::PulseKind;
    use crate::services::click_track::tests::RecordingOutput;
    use crate::services::playback::PlaybackProgress;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::broadcast;
    use tokio::task::LocalSet;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeMicrophone {
        chunks: broadcast::Sender<Vec<f32>>,
        channels: u16,
        fail: bool,
        log: Log,
    }

    #[async_trait(?Send)]
    impl MicrophoneProvider for FakeMicrophone {
        async fn request_access(
            &self,
            _device_id: Option<&str>,
        ) -> Result<MicrophoneStream, MicrophoneError> {
            if self.fail {
                return Err(MicrophoneError::PermissionDenied);
            }
            Ok(MicrophoneStream::from_channel(
                AudioFormat::new(8000, self.channels),
                self.chunks.clone(),
            ))
        }

        fn stop_stream(&self, mut stream: MicrophoneStream) {
            let readers = self.chunks.receiver_count();
            self.log
                .lock()
                .unwrap()
                .push(format!("microphone (readers: {readers})"));
            stream.stop();
        }

        fn permission_state(&self) -> PermissionState {
            if self.fail {
                PermissionState::Denied
            } else {
                PermissionState::Granted
            }
        }
    }

    struct FakePlayer {
        fail_play: bool,
        log: Log,
        /// Readers on the microphone channel tell whether the recorder is
        /// still attached when playback is disposed
        chunks: broadcast::Sender<Vec<f32>>,
    }

    /// Pulses go to the recorder output; the click track's release is logged
    struct ClickOutput {
        pulses: Arc<RecordingOutput>,
        log: Log,
    }

    impl PulseOutput for ClickOutput {
        fn emit(&self, kind: PulseKind, volume: f32) {
            self.pulses.emit(kind, volume);
        }

        fn release(&self) {
            self.log.lock().unwrap().push("click".into());
        }
    }

    impl FakePlayer {
        fn record(&self, call: impl Into<String>) {
            self.log.lock().unwrap().push(call.into());
        }
    }

    impl MelodyPlayer for FakePlayer {
        fn load(&mut self, _melody: &Melody) -> Result<(), PlaybackError> {
            self.record("load");
            Ok(())
        }

        fn play(&mut self) -> Result<(), PlaybackError> {
            if self.fail_play {
                return Err(PlaybackError::Output("no output device".into()));
            }
            self.record("play");
            Ok(())
        }

        fn pause(&mut self) {
            self.record("pause");
        }

        fn resume(&mut self) {
            self.record("resume");
        }

        fn stop(&mut self) {
            self.record("stop");
        }

        fn set_volume(&mut self, volume: f32) {
            self.record(format!("volume:{volume}"));
        }

        fn progress(&self) -> PlaybackProgress {
            PlaybackProgress::default()
        }

        fn dispose(&mut self) {
            let readers = self.chunks.receiver_count();
            self.record(format!("dispose (readers: {readers})"));
        }
    }

    struct Fixture {
        handle: SessionHandle,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        chunks: broadcast::Sender<Vec<f32>>,
        log: Log,
        pulses: Arc<RecordingOutput>,
    }

    impl Fixture {
        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn position(&self, call: &str) -> Option<usize> {
            let prefix = format!("{call} (");
            self.calls()
                .iter()
                .position(|c| c == call || c.starts_with(&prefix))
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn melody() -> Melody {
        // 120 BPM: Hel [0, 0.5), lo [0.5, 1.0), rest, world [1.5, 2.0)
        Melody::new(
            "Test",
            120.0,
            4,
            vec![MelodyLine {
                notes: vec![
                    Note::sung(60, 1.0, "Hel"),
                    Note::sung(62, 1.0, "lo"),
                    Note::rest(1.0),
                    Note::sung(64, 1.0, "world"),
                ],
            }],
        )
    }

    /// Must be called inside a LocalSet
    fn fixture(countdown_seconds: u32, fail_mic: bool, fail_play: bool) -> Fixture {
        fixture_with(melody(), countdown_seconds, 1, fail_mic, fail_play)
    }

    fn fixture_with(
        melody: Melody,
        countdown_seconds: u32,
        mic_channels: u16,
        fail_mic: bool,
        fail_play: bool,
    ) -> Fixture {
        let (chunks, _) = broadcast::channel(64);
        let log: Log = Arc::default();
        let pulses = Arc::new(RecordingOutput::default());

        let deps = SessionDeps {
            microphone: Box::new(FakeMicrophone {
                chunks: chunks.clone(),
                channels: mic_channels,
                fail: fail_mic,
                log: log.clone(),
            }),
            player: Box::new(FakePlayer {
                fail_play,
                log: log.clone(),
                chunks: chunks.clone(),
            }),
            pulse_output: Arc::new(ClickOutput {
                pulses: pulses.clone(),
                log: log.clone(),
            }),
            graph: None,
        };
        let config = SessionConfig {
            countdown_seconds,
            ..SessionConfig::default()
        };
        let (handle, events) = SyncSession::spawn(melody, config, deps);

        Fixture {
            handle,
            events,
            chunks,
            log,
            pulses,
        }
    }

    fn states(events: &[SessionEvent]) -> Vec<SyncSessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initializes_to_ready() {
        LocalSet::new()
            .run_until(async {
                let mut f = fixture(3, false, false);
                f.handle.ready().await.unwrap();

                assert_eq!(f.handle.state(), SyncSessionState::Ready);
                assert_eq!(
                    states(&f.drain_events()),
                    vec![SyncSessionState::Initializing, SyncSessionState::Ready]
                );
                assert_eq!(f.calls(), vec!["load", "volume:0.7"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_failure_is_fatal() {
        LocalSet::new()
            .run_until(async {
                let mut f = fixture(3, true, false);

                let err = f.handle.ready().await.unwrap_err();
                assert!(matches!(err, SessionError::Initialization(_)));
                assert_eq!(f.handle.state(), SyncSessionState::Error);

                let events = f.drain_events();
                assert!(events.iter().any(|e| matches!(
                    e,
                    SessionEvent::Failed {
                        component: Some(SessionComponent::Microphone),
                        ..
                    }
                )));

                let err = f.handle.start().await.unwrap_err();
                assert!(matches!(err, SessionError::InvalidState { .. }));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_then_recording() {
        LocalSet::new()
            .run_until(async {
                let mut f = fixture(3, false, false);
                f.handle.ready().await.unwrap();
                f.drain_events();

                f.handle.start().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Countdown);

                tokio::time::sleep(Duration::from_millis(2500)).await;
                assert_eq!(f.handle.state(), SyncSessionState::Countdown);
                assert_eq!(f.chunks.receiver_count(), 0);

                tokio::time::sleep(Duration::from_secs(1)).await;
                assert_eq!(f.handle.state(), SyncSessionState::Recording);
                assert_eq!(f.chunks.receiver_count(), 1);
                assert!(f.calls().contains(&"play".to_string()));
                assert!(f.pulses.count() >= 1);

                let ticks: Vec<u32> = f
                    .drain_events()
                    .iter()
                    .filter_map(|e| match e {
                        SessionEvent::CountdownTick(n) => Some(*n),
                        _ => None,
                    })
                    .collect();
                assert_eq!(ticks, vec![3, 2, 1]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_countdown_never_records() {
        LocalSet::new()
            .run_until(async {
                let mut f = fixture(3, false, false);
                f.handle.ready().await.unwrap();

                f.handle.start().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1500)).await;

                let err = f.handle.stop().await.unwrap_err();
                assert!(matches!(err, SessionError::NoRecordingData));
                assert_eq!(f.handle.state(), SyncSessionState::Completed);

                // The countdown must not fire later
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(f.handle.state(), SyncSessionState::Completed);
                assert_eq!(
                    states(&f.drain_events()),
                    vec![
                        SyncSessionState::Initializing,
                        SyncSessionState::Ready,
                        SyncSessionState::Countdown,
                        SyncSessionState::Stopping,
                        SyncSessionState::Completed,
                    ]
                );
                assert_eq!(f.chunks.receiver_count(), 0);
                assert!(!f.calls().contains(&"play".to_string()));
                assert_eq!(f.pulses.count(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_take() {
        LocalSet::new()
            .run_until(async {
                let mut f = fixture(0, false, false);
                f.handle.ready().await.unwrap();

                f.handle.start().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Recording);

                f.chunks.send(vec![0.25; 800]).unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;

                f.handle.pause().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Paused);
                let paused_pulses = f.pulses.count();
                f.chunks.send(vec![0.5; 400]).unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;
                assert_eq!(f.pulses.count(), paused_pulses);

                f.handle.resume().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Recording);
                f.chunks.send(vec![-0.25; 800]).unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;

                let result = f.handle.stop().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Completed);
                assert_eq!(result.recording.frames, 1600);
                assert_eq!(result.recording.mime_type, "audio/wav");
                assert!((result.duration_seconds - 2.0).abs() < 0.05);
                assert_eq!(result.title, "Test");
                assert!(result.abc_notation.contains("T:Test"));
                assert_eq!(result.timings.len(), 3);

                let play = f.position("play").unwrap();
                let pause = f.position("pause").unwrap();
                let resume = f.position("resume").unwrap();
                let stop = f.position("stop").unwrap();
                assert!(play < pause && pause < resume && resume < stop);

                let events = f.drain_events();
                assert!(events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::DurationUpdated(_))));
                assert_eq!(
                    states(&events),
                    vec![
                        SyncSessionState::Initializing,
                        SyncSessionState::Ready,
                        SyncSessionState::Recording,
                        SyncSessionState::Paused,
                        SyncSessionState::Recording,
                        SyncSessionState::Stopping,
                        SyncSessionState::Completed,
                    ]
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_paused_resumes() {
        LocalSet::new()
            .run_until(async {
                let f = fixture(0, false, false);
                f.handle.ready().await.unwrap();
                f.handle.start().await.unwrap();
                f.handle.pause().await.unwrap();

                f.handle.start().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Recording);
                assert!(f.calls().contains(&"resume".to_string()));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_start_rolls_back() {
        LocalSet::new()
            .run_until(async {
                let mut f = fixture(0, false, true);
                f.handle.ready().await.unwrap();

                let err = f.handle.start().await.unwrap_err();
                assert!(matches!(
                    err,
                    SessionError::PartialStart {
                        component: SessionComponent::Playback,
                        ..
                    }
                ));
                assert_eq!(f.handle.state(), SyncSessionState::Error);
                assert_eq!(f.chunks.receiver_count(), 0);
                assert!(f.position("microphone").is_some());
                assert!(f.position("dispose").is_some());

                let pulses = f.pulses.count();
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(f.pulses.count(), pulses);

                assert!(f.drain_events().iter().any(|e| matches!(
                    e,
                    SessionEvent::Failed {
                        component: Some(SessionComponent::Playback),
                        ..
                    }
                )));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_start_failure_rolls_back() {
        LocalSet::new()
            .run_until(async {
                // A stream without channels has no audio track to record
                let mut f = fixture_with(melody(), 0, 0, false, false);
                f.handle.ready().await.unwrap();
                f.drain_events();

                let err = f.handle.start().await.unwrap_err();
                assert!(matches!(
                    err,
                    SessionError::PartialStart {
                        component: SessionComponent::Recorder,
                        ..
                    }
                ));
                assert_eq!(f.handle.state(), SyncSessionState::Error);
                assert!(f.position("play").is_none());
                assert_eq!(f.chunks.receiver_count(), 0);
                assert!(f.position("click").is_some());
                assert!(f.position("microphone").is_some());

                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(f.pulses.count(), 0);

                let events = f.drain_events();
                assert!(!states(&events).contains(&SyncSessionState::Recording));
                assert!(events.iter().any(|e| matches!(
                    e,
                    SessionEvent::Failed {
                        component: Some(SessionComponent::Recorder),
                        ..
                    }
                )));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_melody_fails_initialization() {
        LocalSet::new()
            .run_until(async {
                let backwards = Melody::new(
                    "Backwards",
                    120.0,
                    4,
                    vec![MelodyLine {
                        notes: vec![Note::sung(60, 1.0, "one"), Note::sung(62, -1.0, "two")],
                    }],
                );
                let mut f = fixture_with(backwards, 3, 1, false, false);

                let err = f.handle.ready().await.unwrap_err();
                assert!(matches!(err, SessionError::Initialization(_)));
                assert_eq!(f.handle.state(), SyncSessionState::Error);
                // Nothing was acquired: no microphone, no melody load
                assert!(f.calls().is_empty());

                let events = f.drain_events();
                assert_eq!(
                    states(&events),
                    vec![SyncSessionState::Initializing, SyncSessionState::Error]
                );
                assert!(events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::Failed { component: None, .. })));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_releases_in_reverse_order() {
        LocalSet::new()
            .run_until(async {
                let f = fixture(0, false, false);
                f.handle.ready().await.unwrap();
                f.handle.start().await.unwrap();
                assert_eq!(f.chunks.receiver_count(), 1);

                f.handle.dispose().await;
                f.handle.dispose().await;
                assert_eq!(f.handle.state(), SyncSessionState::Idle);

                // Click track, then playback while the recorder still reads,
                // then the recorder detaches before the microphone closes
                let calls = f.calls();
                assert_eq!(
                    calls[calls.len() - 3..],
                    [
                        "click",
                        "dispose (readers: 1)",
                        "microphone (readers: 0)"
                    ]
                );
                assert_eq!(
                    calls.iter().filter(|c| c.starts_with("microphone")).count(),
                    1
                );
                assert_eq!(calls.iter().filter(|c| *c == "click").count(), 1);
                assert_eq!(f.chunks.receiver_count(), 0);

                let pulses = f.pulses.count();
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(f.pulses.count(), pulses);

                assert!(matches!(
                    f.handle.start().await,
                    Err(SessionError::InvalidState { .. })
                ));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_transitions_are_lenient() {
        LocalSet::new()
            .run_until(async {
                let f = fixture(3, false, false);
                f.handle.ready().await.unwrap();

                f.handle.pause().await.unwrap();
                f.handle.resume().await.unwrap();
                assert_eq!(f.handle.state(), SyncSessionState::Ready);

                assert!(matches!(
                    f.handle.stop().await,
                    Err(SessionError::NoRecordingData)
                ));
                assert_eq!(f.handle.state(), SyncSessionState::Ready);
                assert_eq!(f.handle.duration().await.unwrap(), 0.0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_controls() {
        LocalSet::new()
            .run_until(async {
                let f = fixture(0, false, false);
                f.handle.ready().await.unwrap();
                f.handle.set_guide_volume(0.25).await.unwrap();
                f.handle.start().await.unwrap();

                f.handle.set_click_track_enabled(false).await.unwrap();
                f.handle.duration().await.unwrap();
                let pulses = f.pulses.count();
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(f.pulses.count(), pulses);

                f.handle.set_click_volume(0.2).await.unwrap();
                f.handle.set_click_track_enabled(true).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1100)).await;
                assert!(f.pulses.count() > pulses);

                let last = f.pulses.pulses.lock().unwrap().last().map(|p| p.1);
                assert_eq!(last, Some(0.2));
                assert!(f.calls().contains(&"volume:0.25".to_string()));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lyric_lookup() {
        LocalSet::new()
            .run_until(async {
                let f = fixture(3, false, false);

                assert_eq!(f.handle.timings().len(), 3);
                assert_eq!(f.handle.lyric_for_position(0.25), Some("Hel"));
                assert_eq!(f.handle.lyric_for_position(0.75), Some("lo"));
                assert_eq!(f.handle.lyric_for_position(1.25), None);
                assert_eq!(
                    f.handle
                        .lyric_timing_for_position(1.6)
                        .map(|t| t.text.as_str()),
                    Some("world")
                );
            })
            .await;
    }
}
