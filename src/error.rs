//! Error types for the codec, recording, export and session services

use std::fmt;
use thiserror::Error;

use crate::messages::SyncSessionState;

/// WAV encoding error
#[derive(Error, Debug, PartialEq)]
pub enum EncodeError {
    /// Unsupported bit depth, ragged channels or an empty channel list
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Failure to turn a compressed container into PCM
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Container or codec not recognized
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Container recognized but the payload is unusable
    #[error("Corrupt audio data: {0}")]
    Corrupt(String),
}

/// Which input of a two-track mix failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixInput {
    Primary,
    Guide,
}

impl fmt::Display for MixInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MixInput::Primary => write!(f, "primary"),
            MixInput::Guide => write!(f, "guide"),
        }
    }
}

/// Mixing error
#[derive(Error, Debug)]
pub enum MixError {
    #[error("Failed to decode {input} track: {source}")]
    Decode {
        input: MixInput,
        #[source]
        source: DecodeError,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resampling error: {0}")]
    Resample(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<rubato::ResamplerConstructionError> for MixError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        MixError::Resample(e.to_string())
    }
}

impl From<rubato::ResampleError> for MixError {
    fn from(e: rubato::ResampleError) -> Self {
        MixError::Resample(e.to_string())
    }
}

/// Export error
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Recorder service error
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Input stream has no audio tracks")]
    NoAudioTrack,

    #[error("Recorder is not recording")]
    NotRecording,

    #[error("Recording sink failed: {0}")]
    Sink(#[from] anyhow::Error),

    #[error("Recorder service is no longer running")]
    ServiceGone,
}

/// Microphone permission state as reported by the capture provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Unknown,
}

/// Microphone acquisition error
#[derive(Error, Debug)]
pub enum MicrophoneError {
    #[error("Microphone access denied")]
    PermissionDenied,

    #[error("No input audio device available")]
    NoDevice,

    #[error("No input device named '{0}'")]
    DeviceNotFound(String),

    #[error("Audio capture unsupported: {0}")]
    Unsupported(String),
}

impl MicrophoneError {
    pub fn permission_state(&self) -> PermissionState {
        match self {
            MicrophoneError::PermissionDenied => PermissionState::Denied,
            MicrophoneError::NoDevice
            | MicrophoneError::DeviceNotFound(_)
            | MicrophoneError::Unsupported(_) => PermissionState::Unknown,
        }
    }
}

/// Melody playback error
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No melody loaded")]
    NotLoaded,

    #[error("Failed to load melody: {0}")]
    Load(String),

    #[error("Playback failed: {0}")]
    Output(String),
}

/// Click track error
#[derive(Error, Debug, PartialEq)]
pub enum ClickTrackError {
    #[error("Click track has been disposed")]
    Disposed,

    #[error("Invalid tempo: {0}")]
    InvalidTempo(f64),
}

/// Sub-component of a synced session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionComponent {
    Microphone,
    Recorder,
    ClickTrack,
    Playback,
}

impl fmt::Display for SessionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionComponent::Microphone => "microphone",
            SessionComponent::Recorder => "recorder",
            SessionComponent::ClickTrack => "click track",
            SessionComponent::Playback => "melody playback",
        };
        f.write_str(name)
    }
}

/// Synced session error
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No recording data was captured")]
    NoRecordingData,

    #[error("Session failed to initialize: {0}")]
    Initialization(String),

    #[error("Failed to start {component}: {message}")]
    PartialStart {
        component: SessionComponent,
        message: String,
    },

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SyncSessionState,
    },

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("Session has been closed")]
    Closed,
}
