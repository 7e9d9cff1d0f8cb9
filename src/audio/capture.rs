use super::format::AudioFormat;
use crate::error::{MicrophoneError, PermissionState};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use ringbuf::{HeapRb, traits::*};
use std::sync::Arc;
use tokio::sync::{Notify, broadcast, oneshot};

/// Chunks buffered per subscriber before a slow reader starts lagging
const CHUNK_BACKLOG: usize = 64;

/// Source of microphone streams
///
/// Streams hold platform handles that are `!Send`, so providers are used from
/// a `LocalSet`.
#[async_trait(?Send)]
pub trait MicrophoneProvider {
    /// Open the default input, or the device whose name matches `device_id`
    async fn request_access(
        &self,
        device_id: Option<&str>,
    ) -> Result<MicrophoneStream, MicrophoneError>;

    /// Release a stream obtained from `request_access`
    fn stop_stream(&self, mut stream: MicrophoneStream) {
        stream.stop();
    }

    fn permission_state(&self) -> PermissionState;
}

/// A live capture stream fanned out to any number of readers
pub struct MicrophoneStream {
    format: AudioFormat,
    chunks: Option<broadcast::Sender<Vec<f32>>>,
    capture: Option<cpal::Stream>,
    bridge_stop: Option<oneshot::Sender<()>>,
}

impl MicrophoneStream {
    /// Wrap an already-running chunk channel (used by alternative providers)
    pub fn from_channel(format: AudioFormat, chunks: broadcast::Sender<Vec<f32>>) -> Self {
        Self {
            format,
            chunks: Some(chunks),
            capture: None,
            bridge_stop: None,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Subscribe a new reader. Only chunks captured after this call are seen.
    pub fn input(&self) -> InputStream {
        let format = match self.chunks {
            Some(_) => self.format,
            None => AudioFormat::new(self.format.sample_rate, 0),
        };
        InputStream {
            format,
            chunks: self.chunks.as_ref().map(broadcast::Sender::subscribe),
        }
    }

    /// Stop capture. Readers see the channel close once buffered chunks drain.
    pub fn stop(&mut self) {
        if self.capture.take().is_some() {
            tracing::info!("Audio capture stopped");
        }
        self.bridge_stop.take();
        self.chunks.take();
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One reader's view of a microphone stream
pub struct InputStream {
    pub format: AudioFormat,
    chunks: Option<broadcast::Receiver<Vec<f32>>>,
}

impl InputStream {
    pub fn new(format: AudioFormat, chunks: broadcast::Receiver<Vec<f32>>) -> Self {
        Self {
            format,
            chunks: Some(chunks),
        }
    }

    /// Number of audio tracks carried by this input
    pub fn audio_tracks(&self) -> usize {
        usize::from(self.chunks.is_some() && self.format.channels > 0)
    }

    /// Wait for the next interleaved chunk. Returns `None` once the stream is
    /// closed and drained.
    pub async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        let rx = self.chunks.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Input reader lagged, dropped {} chunks", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.chunks = None;
                    return None;
                }
            }
        }
    }

    /// Take a chunk that is already buffered without waiting
    pub fn try_next_chunk(&mut self) -> Option<Vec<f32>> {
        let rx = self.chunks.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Microphone capture through the default cpal host
pub struct CpalMicrophone {
    format: AudioFormat,
}

impl CpalMicrophone {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    fn find_device(device_id: Option<&str>) -> Result<cpal::Device, MicrophoneError> {
        let host = cpal::default_host();
        match device_id {
            None => host.default_input_device().ok_or(MicrophoneError::NoDevice),
            Some(wanted) => host
                .input_devices()
                .map_err(|e| MicrophoneError::Unsupported(e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| MicrophoneError::DeviceNotFound(wanted.to_string())),
        }
    }

    async fn bridge_task(
        mut consumer: impl Consumer<Item = f32>,
        tx: broadcast::Sender<Vec<f32>>,
        chunk_size: usize,
        notify: Arc<Notify>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = &mut stop => break,
            }

            while consumer.occupied_len() >= chunk_size {
                let mut chunk = vec![0.0f32; chunk_size];
                let n = consumer.pop_slice(&mut chunk);
                chunk.truncate(n);

                // No subscribers is fine; the chunk is simply dropped.
                let _ = tx.send(chunk);
            }
        }
        tracing::debug!("Capture bridge exited");
    }
}

#[async_trait(?Send)]
impl MicrophoneProvider for CpalMicrophone {
    async fn request_access(
        &self,
        device_id: Option<&str>,
    ) -> Result<MicrophoneStream, MicrophoneError> {
        let format = self.format;
        let ring = HeapRb::<f32>::new(format.samples_for_duration(10.0));
        let (mut producer, consumer) = ring.split();

        let device = Self::find_device(device_id)?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let notify = Arc::new(Notify::new());
        let notify_callback = notify.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    producer.push_slice(data);
                    notify_callback.notify_one();
                },
                move |err| {
                    tracing::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => MicrophoneError::PermissionDenied,
                other => MicrophoneError::Unsupported(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MicrophoneError::Unsupported(e.to_string()))?;

        let (tx, _) = broadcast::channel(CHUNK_BACKLOG);
        let (stop_tx, stop_rx) = oneshot::channel();
        let chunk_size = format.samples_for_duration(0.1);
        tokio::task::spawn_local(Self::bridge_task(
            consumer,
            tx.clone(),
            chunk_size,
            notify,
            stop_rx,
        ));

        tracing::info!(
            "Audio capture started ({} Hz, {} ch)",
            format.sample_rate,
            format.channels
        );

        Ok(MicrophoneStream {
            format,
            chunks: Some(tx),
            capture: Some(stream),
            bridge_stop: Some(stop_tx),
        })
    }

    fn permission_state(&self) -> PermissionState {
        match Self::find_device(None) {
            Ok(_) => PermissionState::Granted,
            Err(MicrophoneError::PermissionDenied) => PermissionState::Denied,
            Err(_) => PermissionState::Unknown,
        }
    }
}
