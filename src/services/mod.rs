pub mod click_track;
pub mod playback;
pub mod recorder;
pub mod session;
pub mod stopwatch;

pub use click_track::{ClickTrack, MixerPulseOutput, PulseOutput};
pub use playback::{MelodyPlayer, SynthPlayer};
pub use recorder::{Recorder, RecorderHandle, RecordingResult};
pub use session::{SessionConfig, SessionDeps, SessionHandle, SyncSession, SyncSessionResult};
