use super::format::AudioFormat;
use super::sink::AudioSink;
use anyhow::Result;
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use tokio::sync::{mpsc, oneshot};

enum WavCommand {
    WriteChunk(Vec<f32>),
    Finalize {
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
}

/// In-memory WAV encoder running on a dedicated thread
///
/// Audio chunks are sent to the thread via a channel and appended to a WAV
/// stream held in memory, so the recorder loop never blocks on encoding.
/// Dropping the sink without finalizing discards the take.
pub struct WavSink {
    tx: mpsc::UnboundedSender<WavCommand>,
    channels: u16,
    samples_sent: u64,
}

impl WavSink {
    pub fn new(format: AudioFormat) -> Result<Self> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        };

        // Surface an invalid spec here rather than at finalize time.
        WavWriter::new(Cursor::new(Vec::new()), spec)
            .map_err(|e| anyhow::anyhow!("Failed to create WAV writer: {}", e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let finalized = {
                let mut failure: Option<String> = None;
                let mut writer = match WavWriter::new(Cursor::new(&mut buffer), spec) {
                    Ok(writer) => Some(writer),
                    Err(e) => {
                        failure = Some(e.to_string());
                        None
                    }
                };

                loop {
                    match rx.blocking_recv() {
                        Some(WavCommand::WriteChunk(samples)) => {
                            let Some(w) = writer.as_mut() else { continue };
                            for sample in samples {
                                // Convert f32 (-1.0 to 1.0) to i16
                                let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                                if let Err(e) = w.write_sample(amplitude) {
                                    tracing::error!("Failed to write sample: {}", e);
                                    failure = Some(e.to_string());
                                    writer = None;
                                    break;
                                }
                            }
                        }
                        Some(WavCommand::Finalize { reply }) => {
                            let result = match (writer.take(), failure.take()) {
                                (_, Some(reason)) => {
                                    Err(anyhow::anyhow!("WAV stream failed: {}", reason))
                                }
                                (Some(w), None) => w.finalize().map_err(|e| {
                                    anyhow::anyhow!("Failed to finalize WAV: {}", e)
                                }),
                                (None, None) => {
                                    Err(anyhow::anyhow!("WAV writer already finalized"))
                                }
                            };
                            break Some((reply, result));
                        }
                        // Sink dropped without finalizing: discard the take
                        None => break None,
                    }
                }
            };

            if let Some((reply, result)) = finalized {
                let _ = reply.send(result.map(|_| buffer));
            }
        });

        Ok(Self {
            tx,
            channels: format.channels.max(1),
            samples_sent: 0,
        })
    }
}

#[async_trait]
impl AudioSink for WavSink {
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()> {
        self.samples_sent += samples.len() as u64;
        self.tx
            .send(WavCommand::WriteChunk(samples))
            .map_err(|e| anyhow::anyhow!("Failed to send write command: {}", e))
    }

    async fn finalize(&mut self) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WavCommand::Finalize { reply })
            .map_err(|e| anyhow::anyhow!("Failed to send finalize command: {}", e))?;

        rx.await
            .map_err(|e| anyhow::anyhow!("Failed to receive finalize response: {}", e))?
    }

    fn mime_type(&self) -> &'static str {
        "audio/wav"
    }

    fn frames_written(&self) -> u64 {
        self.samples_sent / u64::from(self.channels)
    }
}
