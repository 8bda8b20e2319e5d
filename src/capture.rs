use crate::pcm::AudioFrame;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Input frames handed to the resampler at a time.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Microphone access denied or no input device available: {0}")]
    PermissionDenied(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resampling error: {0}")]
    Resampling(String),
}

/// Microphone-side capability seam: the session only ever sees frames,
/// never the device, so the pipeline is testable without hardware.
#[async_trait]
pub trait AudioSource: Send {
    /// Next captured frame, or `None` once the source has closed.
    async fn next_frame(&mut self) -> Option<AudioFrame>;

    /// Release the underlying device. Idempotent.
    fn close(&mut self);
}

/// Capture configuration, fixed at open time.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device name to capture from (None = default input device).
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16000,
            frame_size: 4096,
        }
    }
}

/// Mono capture from the platform microphone on a dedicated thread that
/// owns the cpal stream. Hardware rates other than the configured one are
/// resampled before frames are emitted.
pub struct CpalSource {
    receiver: mpsc::Receiver<AudioFrame>,
    stop_sender: std::sync::mpsc::Sender<()>,
    closed: bool,
}

impl CpalSource {
    /// Open the microphone. Denial or absence of an input device fails
    /// here, synchronously, as `PermissionDenied`; no retry is attempted.
    pub fn open(config: CaptureConfig) -> Result<Self, CaptureError> {
        let (frame_sender, receiver) = mpsc::channel(32);
        let (stop_sender, stop_receiver) = std::sync::mpsc::channel();
        let (ready_sender, ready_receiver) = std::sync::mpsc::channel();

        thread::spawn(move || {
            Self::run_capture_thread(config, frame_sender, stop_receiver, ready_sender);
        });

        // The thread reports back once the stream is playing (or not), so
        // open failures surface to the caller instead of into a log.
        match ready_receiver.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                receiver,
                stop_sender,
                closed: false,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Stream(
                "capture thread did not start in time".to_string(),
            )),
        }
    }

    fn run_capture_thread(
        config: CaptureConfig,
        frame_sender: mpsc::Sender<AudioFrame>,
        stop_receiver: std::sync::mpsc::Receiver<()>,
        ready_sender: std::sync::mpsc::Sender<Result<(), CaptureError>>,
    ) {
        let result = Self::open_stream(&config, frame_sender);
        match result {
            Ok(stream) => {
                let _ = ready_sender.send(Ok(()));
                // Keep the stream alive until told to stop.
                let _stream = stream;
                loop {
                    match stop_receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                            log::debug!("Capture thread stopping");
                            break;
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    }
                }
            }
            Err(e) => {
                let _ = ready_sender.send(Err(e));
            }
        }
    }

    fn open_stream(
        config: &CaptureConfig,
        frame_sender: mpsc::Sender<AudioFrame>,
    ) -> Result<cpal::Stream, CaptureError> {
        let host = cpal::default_host();
        log::info!("Initializing microphone capture with host: {:?}", host.id());

        let device = if let Some(name) = &config.device_name {
            host.input_devices()
                .map_err(|e| CaptureError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n.contains(name)).unwrap_or(false))
                .ok_or_else(|| CaptureError::Device(format!("Device not found: {}", name)))?
        } else {
            host.default_input_device().ok_or_else(|| {
                CaptureError::PermissionDenied("no default input device found".to_string())
            })?
        };

        log::info!("Using input device: {:?}", device.name());

        let supported_config = Self::select_input_config(&device, config.sample_rate)?;
        let stream_config = supported_config.config();
        let hardware_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!(
            "Hardware: {}Hz, {} channels, {:?} -> output: {}Hz mono frames of {} samples",
            hardware_rate,
            channels,
            supported_config.sample_format(),
            config.sample_rate,
            config.frame_size
        );

        let resampler = if hardware_rate != config.sample_rate {
            let ratio = config.sample_rate as f64 / hardware_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
                .map_err(|e| CaptureError::Resampling(e.to_string()))?;
            log::info!(
                "Resampling {}Hz -> {}Hz (ratio {:.3})",
                hardware_rate,
                config.sample_rate,
                ratio
            );
            Some(resampler)
        } else {
            None
        };

        let stream = match supported_config.sample_format() {
            SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &stream_config,
                channels,
                config.sample_rate,
                config.frame_size,
                frame_sender,
                resampler,
            )?,
            SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &stream_config,
                channels,
                config.sample_rate,
                config.frame_size,
                frame_sender,
                resampler,
            )?,
            SampleFormat::F32 => Self::build_stream::<f32>(
                &device,
                &stream_config,
                channels,
                config.sample_rate,
                config.frame_size,
                frame_sender,
                resampler,
            )?,
            other => {
                return Err(CaptureError::Config(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        };

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => {
                CaptureError::PermissionDenied("input device not available".to_string())
            }
            other => CaptureError::Stream(other.to_string()),
        })?;

        Ok(stream)
    }

    /// Prefer i16/f32 formats and the rate closest to the target.
    fn select_input_config(
        device: &Device,
        target_rate: u32,
    ) -> Result<cpal::SupportedStreamConfig, CaptureError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| CaptureError::Config(e.to_string()))?;

        let mut best_config: Option<cpal::SupportedStreamConfig> = None;
        let mut best_format_rank = u8::MAX;
        let mut best_rate_diff = u32::MAX;

        for config_range in configs {
            let format_rank = match config_range.sample_format() {
                SampleFormat::I16 => 0,
                SampleFormat::F32 => 1,
                SampleFormat::U16 => 2,
                _ => 3,
            };

            let min_rate = config_range.min_sample_rate().0;
            let max_rate = config_range.max_sample_rate().0;
            let chosen_rate = target_rate.clamp(min_rate, max_rate);
            let rate_diff = chosen_rate.abs_diff(target_rate);
            let config = config_range.with_sample_rate(cpal::SampleRate(chosen_rate));

            if format_rank < best_format_rank
                || (format_rank == best_format_rank && rate_diff < best_rate_diff)
            {
                best_format_rank = format_rank;
                best_rate_diff = rate_diff;
                best_config = Some(config);
            }
        }

        best_config.or_else(|| device.default_input_config().ok()).ok_or_else(|| {
            CaptureError::Config("No supported input configs found".to_string())
        })
    }

    fn build_stream<T>(
        device: &Device,
        stream_config: &cpal::StreamConfig,
        channels: usize,
        sample_rate: u32,
        frame_size: usize,
        frame_sender: mpsc::Sender<AudioFrame>,
        mut resampler: Option<SincFixedIn<f32>>,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        f32: FromSample<T>,
    {
        let mut hardware_buffer: Vec<f32> = Vec::new();
        let mut frame_buffer: Vec<f32> = Vec::new();

        let stream = device
            .build_input_stream(
                stream_config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // Channel 0 only, converted to f32.
                    for frame in data.chunks(channels) {
                        if let Some(&sample) = frame.first() {
                            hardware_buffer.push(f32::from_sample(sample));
                        }
                    }

                    if let Some(resampler) = resampler.as_mut() {
                        while hardware_buffer.len() >= RESAMPLE_CHUNK {
                            let chunk: Vec<f32> =
                                hardware_buffer.drain(..RESAMPLE_CHUNK).collect();
                            match resampler.process(&[chunk], None) {
                                Ok(mut output) => frame_buffer.append(&mut output[0]),
                                Err(e) => {
                                    log::error!("Resampling error: {}", e);
                                    return;
                                }
                            }
                        }
                    } else {
                        frame_buffer.append(&mut hardware_buffer);
                    }

                    // The callback runs on the real-time capture cadence and
                    // must never block: full channel means the consumer is
                    // behind, so the frame is dropped with a warning.
                    while frame_buffer.len() >= frame_size {
                        let samples: Vec<f32> = frame_buffer.drain(..frame_size).collect();
                        let frame = AudioFrame::mono(samples, sample_rate);
                        if let Err(e) = frame_sender.try_send(frame) {
                            match e {
                                mpsc::error::TrySendError::Full(_) => {
                                    log::warn!("Capture consumer lagging, dropping frame");
                                }
                                mpsc::error::TrySendError::Closed(_) => return,
                            }
                        }
                    }
                },
                |err| log::error!("Capture stream error: {}", err),
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    CaptureError::PermissionDenied("input device not available".to_string())
                }
                other => CaptureError::Stream(other.to_string()),
            })?;

        Ok(stream)
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    async fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.closed {
            return None;
        }
        self.receiver.recv().await
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stop_sender.send(());
        self.receiver.close();
        log::debug!("Capture source closed");
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}
