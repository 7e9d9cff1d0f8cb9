pub mod capture;
pub mod decode;
pub mod format;
pub mod mixer;
pub mod output;
pub mod resample;
pub mod sink;
pub mod wav;
pub mod wav_sink;

pub use capture::{CpalMicrophone, InputStream, MicrophoneProvider, MicrophoneStream};
pub use format::{AudioFormat, PcmBuffer};
pub use output::AudioGraph;
pub use sink::AudioSink;
pub use wav::{BitDepth, encode_wav};
pub use wav_sink::WavSink;
