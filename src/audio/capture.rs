//! Microphone capture.
//!
//! [`MediaCapture::acquire`] hands back a [`LocalAudio`], the consumer side of
//! a live microphone feed. The producer side, [`LocalAudioFeed`], is driven
//! from the audio callback and applies mute and level metering.

use super::{AudioChunk, InputLevel, resample, rms, to_mono};
use crate::config::AudioConfig;
use crate::error::CaptureFailure;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, DefaultStreamConfigError, StreamConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Source of local microphone audio.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Open the microphone. Failures are categorized for the user.
    async fn acquire(&self) -> std::result::Result<LocalAudio, CaptureFailure>;
}

/// Producer half of a microphone feed.
#[derive(Clone)]
pub struct LocalAudioFeed {
    tx: mpsc::Sender<AudioChunk>,
    enabled: Arc<AtomicBool>,
    level: Arc<watch::Sender<InputLevel>>,
    sample_rate: u32,
    threshold: f32,
}

impl LocalAudioFeed {
    /// Push one block of mono samples. Never blocks.
    ///
    /// While disabled the block is replaced with silence, so the outgoing
    /// track keeps its timing without carrying the user's voice.
    pub fn push(&self, mut samples: Vec<f32>) {
        if !self.enabled.load(Ordering::Relaxed) {
            samples.iter_mut().for_each(|s| *s = 0.0);
        }

        let level = rms(&samples);
        let listening = level > self.threshold;
        self.level.send_if_modified(|current| {
            let flipped = current.listening != listening;
            *current = InputLevel {
                rms: level,
                listening,
            };
            flipped
        });

        let chunk = AudioChunk {
            samples,
            sample_rate: self.sample_rate,
            captured_at: Instant::now(),
        };
        if self.tx.try_send(chunk).is_err() {
            debug!("microphone channel full, dropping chunk");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a live microphone feed.
///
/// Dropping it (or calling [`stop`](Self::stop)) releases the device.
pub struct LocalAudio {
    chunks: Option<mpsc::Receiver<AudioChunk>>,
    enabled: Arc<AtomicBool>,
    level: watch::Receiver<InputLevel>,
    sample_rate: u32,
    stop: CancellationToken,
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("sample_rate", &self.sample_rate)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl LocalAudio {
    /// Create a connected feed/consumer pair.
    pub fn channel(
        sample_rate: u32,
        capacity: usize,
        threshold: f32,
    ) -> (LocalAudioFeed, LocalAudio) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (level_tx, level_rx) = watch::channel(InputLevel::default());
        let enabled = Arc::new(AtomicBool::new(true));
        (
            LocalAudioFeed {
                tx,
                enabled: Arc::clone(&enabled),
                level: Arc::new(level_tx),
                sample_rate,
                threshold,
            },
            LocalAudio {
                chunks: Some(rx),
                enabled,
                level: level_rx,
                sample_rate,
                stop: CancellationToken::new(),
            },
        )
    }

    /// Take the chunk receiver. The transport calls this once when it attaches
    /// the track.
    pub fn take_chunks(&mut self) -> Option<mpsc::Receiver<AudioChunk>> {
        self.chunks.take()
    }

    /// Enable or silence outgoing audio without touching the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Watch the input level.
    pub fn level(&self) -> watch::Receiver<InputLevel> {
        self.level.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Token cancelled when this feed is stopped.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for LocalAudio {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Microphone capture from the system input device via cpal.
///
/// Captures at the device's native configuration and resamples to the
/// configured input rate.
pub struct CpalMicrophone {
    config: AudioConfig,
}

impl CpalMicrophone {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> crate::error::Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().map_err(|e| {
            crate::error::SessionError::Audio(format!("cannot enumerate devices: {e}"))
        })?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl MediaCapture for CpalMicrophone {
    async fn acquire(&self) -> std::result::Result<LocalAudio, CaptureFailure> {
        let (feed, local) = LocalAudio::channel(
            self.config.input_sample_rate,
            self.config.chunk_capacity,
            self.config.listening_threshold,
        );
        let stop = local.stop_token();
        let config = self.config.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let runtime = tokio::runtime::Handle::current();

        // The stream lives on its own thread until the feed is stopped.
        std::thread::Builder::new()
            .name("parley-mic".into())
            .spawn(move || {
                let stream = match open_input_stream(&config, feed) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(failure) => {
                        let _ = ready_tx.send(Err(failure));
                        return;
                    }
                };
                runtime.block_on(stop.cancelled());
                drop(stream);
                info!("microphone capture stopped");
            })
            .map_err(|e| CaptureFailure::Other(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(local),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(CaptureFailure::Other("capture thread exited".into())),
        }
    }
}

fn open_input_stream(
    config: &AudioConfig,
    feed: LocalAudioFeed,
) -> std::result::Result<cpal::Stream, CaptureFailure> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| CaptureFailure::from_backend_message(&e.to_string()))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or(CaptureFailure::DeviceMissing)?
    } else {
        host.default_input_device().ok_or(CaptureFailure::DeviceMissing)?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_name}");

    let default_config = device.default_input_config().map_err(|e| match e {
        DefaultStreamConfigError::DeviceNotAvailable => CaptureFailure::DeviceMissing,
        other => CaptureFailure::from_backend_message(&other.to_string()),
    })?;

    let native_rate = default_config.sample_rate();
    let supported: Vec<u16> = device
        .supported_input_configs()
        .map(|ranges| {
            ranges
                .filter(|r| {
                    r.min_sample_rate() <= native_rate && native_rate <= r.max_sample_rate()
                })
                .map(|r| r.channels())
                .collect()
        })
        .unwrap_or_default();
    let channels = choose_channels(config.input_channels, default_config.channels(), &supported);
    let target_rate = config.input_sample_rate;
    let stream_config = StreamConfig {
        channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "input config: {}Hz, {} channels (requested {}) -> {}Hz mono",
        native_rate, channels, config.input_channels, target_rate
    );

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if channels > 1 {
                    to_mono(data, channels)
                } else {
                    data.to_vec()
                };
                feed.push(resample(&mono, native_rate, target_rate));
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => CaptureFailure::DeviceMissing,
            other => CaptureFailure::from_backend_message(&other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| CaptureFailure::from_backend_message(&e.to_string()))?;

    info!("microphone capture started");
    Ok(stream)
}

/// The configured channel count when the device offers it at the native
/// rate, else the device's own default.
fn choose_channels(requested: u16, native: u16, supported: &[u16]) -> u16 {
    if supported.contains(&requested) {
        requested
    } else {
        native
    }
}
