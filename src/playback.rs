use crate::pcm::PlaybackBuffer;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PlaybackError {
    #[error("Audio output device error: {0}")]
    Device(String),

    #[error("Failed to queue audio data: {0}")]
    Write(String),

    #[error("Failed to stop audio playback: {0}")]
    Stop(String),
}

/// Speaker-side capability seam. Implementations queue decoded samples for
/// output; `stop` is a hard stop that also clears anything queued but not
/// yet audible.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Hand a buffer to the output device. Must enqueue and return without
    /// yielding: callers poll the session inside `select!`, and a `play`
    /// that suspends mid-call can be dropped along with its buffer.
    async fn play(&self, buffer: &PlaybackBuffer) -> Result<(), PlaybackError>;

    /// Halt the currently playing buffer and discard queued samples.
    /// Idempotent.
    async fn stop(&self) -> Result<(), PlaybackError>;
}

/// Owns the single monotonic "next start time" cursor and enforces
/// strictly sequential, gapless output of buffers scheduled in order.
///
/// The cursor is never read or written by any other component; callers
/// schedule buffers one at a time, in arrival order, and that call is the
/// pipeline's one serialization point.
pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    cursor: Instant,
    output_sample_rate: u32,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioSink>, output_sample_rate: u32) -> Self {
        Self {
            sink,
            cursor: Instant::now(),
            output_sample_rate,
        }
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Schedule a buffer to begin exactly when the previous one ends (or
    /// immediately if playback has drained). Returns the start time.
    pub async fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<Instant, PlaybackError> {
        self.schedule_at(buffer, Instant::now()).await
    }

    /// `schedule` with an explicit clock reading, so the cursor arithmetic
    /// is deterministic under test.
    pub async fn schedule_at(
        &mut self,
        buffer: PlaybackBuffer,
        now: Instant,
    ) -> Result<Instant, PlaybackError> {
        let start_at = self.cursor.max(now);
        self.sink.play(&buffer).await?;
        self.cursor = start_at + buffer.duration;
        log::debug!(
            "Scheduled {:?} of audio, cursor now {:?} ahead of start",
            buffer.duration,
            self.cursor - start_at
        );
        Ok(start_at)
    }

    /// Hard stop: halt the playing buffer, discard scheduled-but-not-
    /// started ones, reset the cursor to now. Idempotent.
    pub async fn stop(&mut self) -> Result<(), PlaybackError> {
        self.stop_at(Instant::now()).await
    }

    pub async fn stop_at(&mut self, now: Instant) -> Result<(), PlaybackError> {
        self.sink.stop().await?;
        self.cursor = now;
        Ok(())
    }

    /// The instant playback of everything scheduled so far will end.
    pub fn busy_until(&self) -> Instant {
        self.cursor
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.cursor <= now
    }
}

enum SinkCommand {
    Play(Vec<f32>),
    Clear,
    Shutdown,
}

/// cpal speaker binding: a dedicated thread owns the output stream and a
/// sample queue at the pipeline's output rate; the output callback drains
/// the queue with linear interpolation up to the hardware rate.
pub struct CpalSink {
    command_sender: Sender<SinkCommand>,
    queued_samples: Arc<AtomicUsize>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    pub fn new(pipeline_rate: u32) -> Result<Self, PlaybackError> {
        let (command_sender, command_receiver) = channel();
        let queued_samples = Arc::new(AtomicUsize::new(0));
        let queued_clone = Arc::clone(&queued_samples);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("No output device found".to_string()))?;
        log::debug!("Playback: using output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        let hardware_rate = supported_config.sample_rate().0;
        let output_channels = supported_config.channels() as usize;
        log::debug!(
            "Playback: {}Hz pipeline -> {}Hz x{} hardware",
            pipeline_rate,
            hardware_rate,
            output_channels
        );

        let queue = Arc::new(Mutex::new(Vec::<f32>::new()));
        let queue_for_callback = Arc::clone(&queue);

        let audio_thread = thread::spawn(move || {
            let stream = match device.build_output_stream(
                &supported_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = match queue_for_callback.lock() {
                        Ok(queue) => queue,
                        Err(_) => return,
                    };

                    let output_frames = data.len() / output_channels;
                    let step = pipeline_rate as f32 / hardware_rate as f32;
                    let needed = (output_frames as f32 * step).ceil() as usize;

                    let mut position: f32 = 0.0;
                    for frame in data.chunks_mut(output_channels) {
                        let sample = if queue.is_empty() {
                            0.0
                        } else {
                            let floor = position.floor() as usize;
                            let fract = position.fract();
                            let a = queue.get(floor).copied().unwrap_or(0.0);
                            let b = queue.get(floor + 1).copied().unwrap_or(a);
                            a * (1.0 - fract) + b * fract
                        };
                        for channel in frame.iter_mut() {
                            *channel = sample;
                        }
                        position += step;
                    }

                    let consumed = needed.min(queue.len());
                    queue.drain(0..consumed);
                    queued_clone.store(queue.len(), Ordering::Release);
                },
                |err| log::error!("Playback stream error: {}", err),
                None,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Playback: failed to create output stream: {}", e);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                log::error!("Playback: failed to start output stream: {}", e);
                return;
            }

            while let Ok(command) = command_receiver.recv() {
                match command {
                    SinkCommand::Play(samples) => {
                        if let Ok(mut queue) = queue.lock() {
                            queue.extend_from_slice(&samples);
                        }
                    }
                    SinkCommand::Clear => {
                        if let Ok(mut queue) = queue.lock() {
                            queue.clear();
                        }
                        log::debug!("Playback: queue cleared");
                    }
                    SinkCommand::Shutdown => break,
                }
            }
            log::debug!("Playback thread exiting");
        });

        Ok(Self {
            command_sender,
            queued_samples,
            audio_thread: Some(audio_thread),
        })
    }

    pub fn queued_samples(&self) -> usize {
        self.queued_samples.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, buffer: &PlaybackBuffer) -> Result<(), PlaybackError> {
        self.command_sender
            .send(SinkCommand::Play(buffer.samples.clone()))
            .map_err(|e| PlaybackError::Write(e.to_string()))
    }

    async fn stop(&self) -> Result<(), PlaybackError> {
        self.command_sender
            .send(SinkCommand::Clear)
            .map_err(|e| PlaybackError::Stop(e.to_string()))
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.command_sender.send(SinkCommand::Shutdown);
        if let Some(thread) = self.audio_thread.take() {
            let _ = thread.join();
        }
    }
}
