//! Remote audio output to system speakers via cpal.
//!
//! The remote track is pushed into a shared queue that the output callback
//! drains. A [`PlaybackCursor`] counts what actually reached the device so
//! the lip-sync clock can follow the audible position.

use super::{AudioChunk, resample};
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use crate::viseme::AudioProgress;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Audible progress of an output stream.
#[derive(Debug)]
pub struct PlaybackCursor {
    sample_rate: u32,
    played: AtomicU64,
    paused: AtomicBool,
    starved: AtomicBool,
}

impl PlaybackCursor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            played: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            starved: AtomicBool::new(true),
        }
    }

    fn advance(&self, samples: usize) {
        self.played.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
}

impl AudioProgress for PlaybackCursor {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed) || self.starved.load(Ordering::Relaxed)
    }

    fn position(&self) -> Duration {
        let played = self.played.load(Ordering::Relaxed);
        Duration::from_nanos(played.saturating_mul(1_000_000_000) / u64::from(self.sample_rate))
    }
}

/// Fill one output buffer from the queue.
///
/// Real samples advance the cursor; the remainder is zero-filled. An empty
/// queue marks the cursor as starved, which the clock treats as paused.
pub(crate) fn fill_output(out: &mut [f32], queue: &mut VecDeque<f32>, cursor: &PlaybackCursor) {
    if cursor.paused.load(Ordering::Relaxed) {
        out.fill(0.0);
        return;
    }
    let mut real = 0;
    for sample in out.iter_mut() {
        match queue.pop_front() {
            Some(s) => {
                *sample = s;
                real += 1;
            }
            None => *sample = 0.0,
        }
    }
    cursor.advance(real);
    cursor.starved.store(real == 0, Ordering::Relaxed);
}

/// Destination for a remote audio track.
pub trait AudioOutput: Send + Sync {
    /// Start rendering `track`. Returns the progress view for the lip-sync clock.
    fn attach(&self, track: mpsc::Receiver<AudioChunk>) -> Arc<dyn AudioProgress>;

    /// Stop rendering the current track and drop anything still buffered.
    fn detach(&self);
}

/// Speaker output for the remote track.
pub struct RemoteAudioOutput {
    queue: Arc<Mutex<VecDeque<f32>>>,
    cursor: Arc<PlaybackCursor>,
    sample_rate: u32,
    forwarder: Mutex<Option<CancellationToken>>,
    stream_stop: CancellationToken,
}

impl RemoteAudioOutput {
    /// Open the output device and start an idle stream.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be started.
    pub async fn open(config: &AudioConfig) -> Result<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let cursor = Arc::new(PlaybackCursor::new(config.output_sample_rate));
        let stream_stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let runtime = tokio::runtime::Handle::current();

        let thread_config = config.clone();
        let thread_queue = Arc::clone(&queue);
        let thread_cursor = Arc::clone(&cursor);
        let stop = stream_stop.clone();
        std::thread::Builder::new()
            .name("parley-speaker".into())
            .spawn(move || {
                let stream = match open_output_stream(&thread_config, thread_queue, thread_cursor)
                {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(stop.cancelled());
                drop(stream);
                info!("remote audio output stopped");
            })?;

        ready_rx
            .await
            .map_err(|_| SessionError::Audio("output thread exited".into()))??;

        Ok(Self {
            queue,
            cursor,
            sample_rate: config.output_sample_rate,
            forwarder: Mutex::new(None),
            stream_stop,
        })
    }

    pub fn cursor(&self) -> Arc<PlaybackCursor> {
        Arc::clone(&self.cursor)
    }

    pub fn pause(&self) {
        self.cursor.set_paused(true);
    }

    pub fn resume(&self) {
        self.cursor.set_paused(false);
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SessionError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl AudioOutput for RemoteAudioOutput {
    fn attach(&self, mut track: mpsc::Receiver<AudioChunk>) -> Arc<dyn AudioProgress> {
        self.detach();
        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.forwarder.lock() {
            *slot = Some(cancel.clone());
        }

        let queue = Arc::clone(&self.queue);
        let out_rate = self.sample_rate;
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = track.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                let samples = resample(&chunk.samples, chunk.sample_rate, out_rate);
                match queue.lock() {
                    Ok(mut q) => q.extend(samples),
                    Err(_) => break,
                }
            }
        });

        self.resume();
        self.cursor() as Arc<dyn AudioProgress>
    }

    fn detach(&self) {
        if let Ok(mut slot) = self.forwarder.lock()
            && let Some(cancel) = slot.take()
        {
            cancel.cancel();
        }
        if let Ok(mut q) = self.queue.lock() {
            q.clear();
        }
    }
}

impl Drop for RemoteAudioOutput {
    fn drop(&mut self) {
        self.detach();
        self.stream_stop.cancel();
    }
}

fn open_output_stream(
    config: &AudioConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
    cursor: Arc<PlaybackCursor>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| SessionError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SessionError::Audio("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut q) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                fill_output(data, &mut q, &cursor);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SessionError::Audio(format!("failed to start output stream: {e}")))?;

    info!("remote audio output started at {}Hz", config.output_sample_rate);
    Ok(stream)
}
