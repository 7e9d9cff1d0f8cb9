use super::stopwatch::Stopwatch;
use crate::audio::{AudioFormat, AudioSink, InputStream, WavSink};
use crate::error::RecorderError;
use crate::messages::{RecorderCommand, RecorderEvent, RecorderState};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};

const DURATION_TICK: Duration = Duration::from_secs(1);

/// A finished take
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    pub audio: Vec<u8>,
    pub mime_type: String,
    /// Active (non-paused) recording time
    pub duration_seconds: f64,
    /// Sample frames captured
    pub frames: u64,
}

/// Builds the encoder for each new take
pub type SinkFactory =
    Box<dyn Fn(AudioFormat) -> anyhow::Result<Box<dyn AudioSink + Send>> + Send>;

/// Records one input stream at a time
///
/// This service:
/// - Tracks the inactive/recording/paused lifecycle
/// - Streams captured chunks to an AudioSink while recording, discards them while paused
/// - Accounts active time, excluding paused intervals
/// - Emits a duration update about once per second while recording
pub struct Recorder {
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    events: mpsc::UnboundedSender<RecorderEvent>,
    make_sink: SinkFactory,
    input: Option<InputStream>,
    sink: Option<Box<dyn AudioSink + Send>>,
    state: RecorderState,
    clock: Stopwatch,
    ticker: Interval,
}

impl Recorder {
    pub fn new(
        cmd_rx: mpsc::Receiver<RecorderCommand>,
        events: mpsc::UnboundedSender<RecorderEvent>,
        make_sink: SinkFactory,
    ) -> Self {
        let mut ticker = tokio::time::interval(DURATION_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            cmd_rx,
            events,
            make_sink,
            input: None,
            sink: None,
            state: RecorderState::Inactive,
            clock: Stopwatch::new(),
            ticker,
        }
    }

    /// Spawn a recorder that encodes takes as 16-bit WAV
    pub fn spawn() -> (RecorderHandle, mpsc::UnboundedReceiver<RecorderEvent>) {
        Self::spawn_with_sink(Box::new(|format| {
            Ok(Box::new(WavSink::new(format)?) as Box<dyn AudioSink + Send>)
        }))
    }

    pub fn spawn_with_sink(
        make_sink: SinkFactory,
    ) -> (RecorderHandle, mpsc::UnboundedReceiver<RecorderEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let recorder = Self::new(cmd_rx, event_tx, make_sink);
        tokio::spawn(recorder.run());
        (RecorderHandle::new(cmd_tx), event_rx)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                // Handle commands from the session
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                // Receive audio chunks while a take is open
                Some(chunk) = next_chunk(&mut self.input), if self.state != RecorderState::Inactive => {
                    self.handle_chunk(chunk);
                }

                _ = self.ticker.tick(), if self.state == RecorderState::Recording => {
                    self.emit(RecorderEvent::DurationUpdated(self.clock.elapsed_seconds()));
                }
            }
        }

        self.release();
        tracing::debug!("Recorder service exited");
    }

    fn handle_chunk(&mut self, chunk: Vec<f32>) {
        if self.state != RecorderState::Recording {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        // Stream chunk to sink (Vec is moved, no copy)
        if let Err(e) = sink.write_chunk(chunk) {
            tracing::error!("Failed to write audio chunk: {}", e);
        }
    }

    async fn handle_command(&mut self, cmd: RecorderCommand) {
        match cmd {
            RecorderCommand::Start { input, reply } => {
                let _ = reply.send(self.start(input));
            }
            RecorderCommand::Pause(reply) => {
                if self.state == RecorderState::Recording {
                    // Chunks captured before the pause still belong to the take
                    self.flush_pending();
                    self.clock.pause();
                    self.set_state(RecorderState::Paused);
                    tracing::info!("Recording paused");
                } else {
                    tracing::debug!("Pause ignored while {:?}", self.state);
                }
                let _ = reply.send(());
            }
            RecorderCommand::Resume(reply) => {
                if self.state == RecorderState::Paused {
                    // Anything captured during the pause is not part of the take
                    if let Some(input) = self.input.as_mut() {
                        while input.try_next_chunk().is_some() {}
                    }
                    self.clock.start();
                    self.ticker.reset();
                    self.set_state(RecorderState::Recording);
                    tracing::info!("Recording resumed");
                } else {
                    tracing::debug!("Resume ignored while {:?}", self.state);
                }
                let _ = reply.send(());
            }
            RecorderCommand::Stop(reply) => {
                let _ = reply.send(self.stop().await);
            }
            RecorderCommand::Duration(reply) => {
                let _ = reply.send(self.clock.elapsed_seconds());
            }
            RecorderCommand::Dispose(reply) => {
                self.release();
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, input: InputStream) -> Result<(), RecorderError> {
        if self.state != RecorderState::Inactive {
            tracing::debug!("Start ignored while {:?}", self.state);
            return Ok(());
        }

        if input.audio_tracks() == 0 {
            return Err(RecorderError::NoAudioTrack);
        }

        let sink = (self.make_sink)(input.format)?;

        self.sink = Some(sink);
        self.input = Some(input);
        self.clock.reset();
        self.clock.start();
        self.ticker.reset();
        self.set_state(RecorderState::Recording);
        tracing::info!("Recording started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<RecordingResult, RecorderError> {
        if self.state == RecorderState::Inactive {
            return Err(RecorderError::NotRecording);
        }

        // The last chunks may still be queued behind the stop signal
        self.flush_pending();

        self.clock.pause();
        let duration_seconds = self.clock.elapsed_seconds();
        self.input = None;

        let mut sink = self.sink.take().ok_or(RecorderError::NotRecording)?;
        let finalized = sink.finalize().await;
        self.set_state(RecorderState::Inactive);

        let audio = finalized?;
        tracing::info!("Recording stopped ({:.1}s)", duration_seconds);

        Ok(RecordingResult {
            audio,
            mime_type: sink.mime_type().to_string(),
            duration_seconds,
            frames: sink.frames_written(),
        })
    }

    /// Write chunks that are already queued. Only effective while recording.
    fn flush_pending(&mut self) {
        if self.state != RecorderState::Recording {
            return;
        }
        while let Some(chunk) = self.input.as_mut().and_then(InputStream::try_next_chunk) {
            self.handle_chunk(chunk);
        }
    }

    /// Drop the open take and input, reset time accounting
    fn release(&mut self) {
        self.input = None;
        self.sink = None;
        self.clock.reset();
        if self.state != RecorderState::Inactive {
            self.set_state(RecorderState::Inactive);
            tracing::info!("Recorder disposed, take discarded");
        }
    }

    fn set_state(&mut self, state: RecorderState) {
        if self.state != state {
            self.state = state;
            self.emit(RecorderEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: RecorderEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

async fn next_chunk(input: &mut Option<InputStream>) -> Option<Vec<f32>> {
    match input.as_mut() {
        Some(input) => match input.next_chunk().await {
            Some(chunk) => Some(chunk),
            // Input ended; keep the take open until told to stop
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Handle for communicating with the Recorder
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn new(tx: mpsc::Sender<RecorderCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Result<T, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RecorderError::ServiceGone)?;
        rx.await.map_err(|_| RecorderError::ServiceGone)
    }

    pub async fn start(&self, input: InputStream) -> Result<(), RecorderError> {
        self.request(|reply| RecorderCommand::Start { input, reply })
            .await?
    }

    pub async fn pause(&self) -> Result<(), RecorderError> {
        self.request(RecorderCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), RecorderError> {
        self.request(RecorderCommand::Resume).await
    }

    pub async fn stop(&self) -> Result<RecordingResult, RecorderError> {
        self.request(RecorderCommand::Stop).await?
    }

    pub async fn duration(&self) -> Result<f64, RecorderError> {
        self.request(RecorderCommand::Duration).await
    }

    /// Discard any open take. Idempotent; a stopped service counts as disposed.
    pub async fn dispose(&self) {
        if self.request(RecorderCommand::Dispose).await.is_err() {
            tracing::debug!("Recorder already gone during dispose");
        }
    }
}
