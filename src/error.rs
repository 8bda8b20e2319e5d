use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] crate::playback::PlaybackError),

    #[error("Codec error: {0}")]
    Pcm(#[from] crate::pcm::PcmError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
