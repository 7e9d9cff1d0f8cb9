use anyhow::Result;
use async_trait::async_trait;

/// Trait for streaming audio encoding
///
/// Implementations encode captured samples into a container in a streaming
/// fashion, writing data as it arrives rather than buffering raw floats.
#[async_trait]
pub trait AudioSink: Send {
    /// Write interleaved audio samples (called repeatedly during recording)
    /// The Vec is moved to avoid copying
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()>;

    /// Finalize the container and hand back its bytes
    async fn finalize(&mut self) -> Result<Vec<u8>>;

    /// MIME type of the finalized container
    fn mime_type(&self) -> &'static str;

    /// Sample frames written so far
    fn frames_written(&self) -> u64;
}
