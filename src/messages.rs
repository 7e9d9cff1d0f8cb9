use crate::audio::InputStream;
use crate::error::{RecorderError, SessionComponent, SessionError};
use crate::services::recorder::RecordingResult;
use crate::services::session::SyncSessionResult;
use tokio::sync::oneshot;

/// Commands for the Recorder service
pub enum RecorderCommand {
    Start {
        input: InputStream,
        reply: oneshot::Sender<Result<(), RecorderError>>,
    },
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<Result<RecordingResult, RecorderError>>),
    Duration(oneshot::Sender<f64>),
    Dispose(oneshot::Sender<()>),
}

/// Recorder lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Inactive,
    Recording,
    Paused,
}

/// Notifications emitted by the Recorder service
#[derive(Clone, Debug, PartialEq)]
pub enum RecorderEvent {
    StateChanged(RecorderState),
    /// Accumulated active seconds, roughly once per second while recording
    DurationUpdated(f64),
}

/// Synced session lifecycle (observable via watch channel)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSessionState {
    Idle,
    Initializing,
    Ready,
    Countdown,
    Recording,
    Paused,
    Stopping,
    Completed,
    Error,
}

/// Current session state plus the reason for the last failure
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub state: SyncSessionState,
    pub error: Option<String>,
}

/// Commands for the synced session service
pub enum SessionCommand {
    Start(oneshot::Sender<Result<(), SessionError>>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<Result<SyncSessionResult, SessionError>>),
    Duration(oneshot::Sender<f64>),
    SetGuideVolume(f32),
    SetClickTrackEnabled(bool),
    SetClickVolume(f32),
    SetClickTempo(f64),
    Dispose(oneshot::Sender<()>),
}

/// Notifications emitted by the synced session service
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged(SyncSessionState),
    /// Whole seconds left before recording begins
    CountdownTick(u32),
    DurationUpdated(f64),
    Failed {
        component: Option<SessionComponent>,
        message: String,
    },
}
