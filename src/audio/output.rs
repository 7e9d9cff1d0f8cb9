use anyhow::{Context, Result};
use rodio::mixer::Mixer;
use rodio::{OutputStream, OutputStreamBuilder};

/// Shared playback destination
///
/// Owns the platform output stream. Click pulses and the guide melody are
/// added as independent sources on the same mixer, so adding or removing one
/// never touches the other's gain.
pub struct AudioGraph {
    stream: Option<OutputStream>,
    mixer: Mixer,
}

impl AudioGraph {
    pub fn open_default() -> Result<Self> {
        let mut stream =
            OutputStreamBuilder::open_default_stream().context("Failed to open audio output")?;
        stream.log_on_drop(false);
        let mixer = stream.mixer().clone();

        tracing::info!("Audio output opened");
        Ok(Self {
            stream: Some(stream),
            mixer,
        })
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    /// Close the output. Safe to call more than once.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Audio output closed");
        } else {
            tracing::debug!("Audio output already closed");
        }
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.close();
    }
}
