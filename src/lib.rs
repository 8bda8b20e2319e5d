pub mod capture;
pub mod config;
pub mod controller;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod pcm;
pub mod playback;
pub mod session;

pub use config::{ApiConfig, SessionConfig, VoiceId};
pub use controller::{ControllerEvent, SessionController, SessionState, Speaker, TranscriptEvent};
pub use engine::AudioEngine;
pub use error::{Result, VoiceError};
pub use pcm::{AudioFrame, EncodedChunk, PlaybackBuffer};
