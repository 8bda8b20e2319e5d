use crate::capture::{AudioSource, CaptureConfig, CaptureError, CpalSource};
use crate::config::SessionConfig;
use crate::playback::{AudioSink, CpalSink, PlaybackError};

/// Platform audio access behind an owned resource with an explicit
/// lifecycle. The controller holds one engine and opens exactly one
/// source and one sink per session; nothing here is process-global, so
/// independent sessions (and tests) can coexist.
pub trait AudioEngine: Send + Sync {
    fn open_source(&self, config: &SessionConfig) -> Result<Box<dyn AudioSource>, CaptureError>;

    fn open_sink(&self, config: &SessionConfig) -> Result<Box<dyn AudioSink>, PlaybackError>;
}

/// Hardware engine backed by cpal input/output devices.
#[derive(Debug, Clone, Default)]
pub struct CpalEngine {
    /// Capture device name (None = platform default).
    pub input_device: Option<String>,
}

impl CpalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_device(name: impl Into<String>) -> Self {
        Self {
            input_device: Some(name.into()),
        }
    }
}

impl AudioEngine for CpalEngine {
    fn open_source(&self, config: &SessionConfig) -> Result<Box<dyn AudioSource>, CaptureError> {
        let capture_config = CaptureConfig {
            device_name: self.input_device.clone(),
            sample_rate: config.input_sample_rate,
            frame_size: config.frame_size,
        };
        Ok(Box::new(CpalSource::open(capture_config)?))
    }

    fn open_sink(&self, config: &SessionConfig) -> Result<Box<dyn AudioSink>, PlaybackError> {
        Ok(Box::new(CpalSink::new(config.output_sample_rate)?))
    }
}
