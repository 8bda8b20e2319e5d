use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pcm::EncodedChunk;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Base64 payload plus its MIME descriptor, e.g. "audio/pcm;rate=16000".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaBlob {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Outbound wire shape: one message per captured frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub media: MediaBlob,
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Classified inbound message. Anything the session cannot make sense of
/// becomes `Unrecognized` so the controller can log it and keep going.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Running speech-to-text of the user's own utterance.
    TranscriptText(String),
    /// A segment of synthesized speech from the remote party, still base64.
    AudioChunk {
        data: String,
        sample_rate: Option<u32>,
    },
    /// The remote party's current utterance has finished.
    TurnComplete,
    SessionError(String),
    SessionClosed,
    Unrecognized(String),
}

#[derive(Debug, Deserialize)]
struct TranscriptBody {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    transcript: Option<TranscriptBody>,
    #[serde(rename = "inlineData")]
    inline_data: Option<MediaBlob>,
    #[serde(rename = "turnComplete")]
    turn_complete: Option<bool>,
    error: Option<ErrorBody>,
    closed: Option<bool>,
}

/// Wrap an encoded chunk in the session's outbound wire shape. Total: an
/// empty chunk formats as an empty payload, not an error.
pub fn format_outbound(chunk: &EncodedChunk) -> WireMessage {
    WireMessage {
        media: MediaBlob {
            data: BASE64.encode(&chunk.bytes),
            mime_type: chunk.mime_type.clone(),
        },
    }
}

/// Classify a raw inbound message into exactly one event.
pub fn parse_inbound(raw: &str) -> InboundEvent {
    let message: InboundMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(_) => return InboundEvent::Unrecognized(raw.to_string()),
    };

    if let Some(error) = message.error {
        let text = match (error.message, error.code) {
            (Some(m), Some(c)) => format!("{} (code {})", m, c),
            (Some(m), None) => m,
            (None, Some(c)) => format!("remote error code {}", c),
            (None, None) => "unspecified remote error".to_string(),
        };
        return InboundEvent::SessionError(text);
    }
    if message.closed == Some(true) {
        return InboundEvent::SessionClosed;
    }
    if let Some(blob) = message.inline_data {
        return InboundEvent::AudioChunk {
            sample_rate: parse_rate(&blob.mime_type),
            data: blob.data,
        };
    }
    if let Some(transcript) = message.transcript {
        return InboundEvent::TranscriptText(transcript.text);
    }
    if message.turn_complete == Some(true) {
        return InboundEvent::TurnComplete;
    }

    InboundEvent::Unrecognized(raw.to_string())
}

/// Decode a base64 audio payload into raw PCM bytes.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, EnvelopeError> {
    Ok(BASE64.decode(data)?)
}

/// Extract the sample rate from a "audio/pcm;rate=24000" style tag.
pub fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("rate="))
        .and_then(|rate| rate.parse().ok())
}
