use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PcmError {
    #[error("PCM byte length {0} is not a whole number of 16-bit samples")]
    TruncatedSample(usize),

    #[error("Sample count {samples} is not divisible by channel count {channels}")]
    RaggedChannels { samples: usize, channels: u16 },

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Invalid sample rate: {0}")]
    InvalidRate(u32),
}

/// One capture callback's worth of normalized samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }
}

/// PCM16LE bytes with their declared rate, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub mime_type: String,
}

/// Decoded samples at the output rate, owned by the playback scheduler
/// from decode until playback completion.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Duration,
}

pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Quantize normalized f32 samples to PCM16 little-endian.
///
/// Samples outside [-1.0, 1.0] wrap rather than saturate: the i32 -> i16
/// cast truncates, so e.g. 1.0 quantizes to -32768. Downstream output
/// characteristics depend on this, so it is not clamped here.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        let quantized = (sample * 32768.0).round() as i32 as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    EncodedChunk {
        bytes,
        sample_rate: frame.sample_rate,
        mime_type: pcm_mime(frame.sample_rate),
    }
}

/// Decode PCM16 little-endian bytes into normalized samples.
///
/// Sample pairs are read bytewise, so the input may be a view at any byte
/// offset into a larger buffer; no 2-byte-aligned reinterpretation ever
/// happens. An odd byte length is a per-chunk error, not a session error.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlaybackBuffer, PcmError> {
    if sample_rate == 0 {
        return Err(PcmError::InvalidRate(sample_rate));
    }
    if channels == 0 {
        return Err(PcmError::InvalidChannels(channels));
    }
    if bytes.len() % 2 != 0 {
        return Err(PcmError::TruncatedSample(bytes.len()));
    }

    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        samples.push(value as f32 / 32768.0);
    }

    if samples.len() % channels as usize != 0 {
        return Err(PcmError::RaggedChannels {
            samples: samples.len(),
            channels,
        });
    }

    let frames = samples.len() / channels as usize;
    let duration = Duration::from_secs_f64(frames as f64 / sample_rate as f64);

    Ok(PlaybackBuffer {
        samples,
        sample_rate,
        channels,
        duration,
    })
}

/// Split interleaved samples into per-channel buffers, preserving channel
/// order. Frame count is `samples.len() / channels`.
pub fn deinterleave(samples: &[f32], channels: u16) -> Result<Vec<Vec<f32>>, PcmError> {
    if channels == 0 {
        return Err(PcmError::InvalidChannels(channels));
    }
    let channels = channels as usize;
    if samples.len() % channels != 0 {
        return Err(PcmError::RaggedChannels {
            samples: samples.len(),
            channels: channels as u16,
        });
    }

    let frames = samples.len() / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (channel, &sample) in frame.iter().enumerate() {
            out[channel].push(sample);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>) -> AudioFrame {
        AudioFrame::mono(samples, 16000)
    }

    #[test]
    fn round_trip_within_one_quantization_step() {
        let samples: Vec<f32> = (0..4096)
            .map(|i| ((i as f32 / 4096.0) * 2.0 - 1.0) * 0.999)
            .collect();
        let chunk = encode(&frame(samples.clone()));
        let decoded = decode(&chunk.bytes, 16000, 1).unwrap();

        assert_eq!(decoded.samples.len(), samples.len());
        for (original, recovered) in samples.iter().zip(&decoded.samples) {
            assert!(
                (original - recovered).abs() <= 1.0 / 32768.0,
                "sample {} decoded as {}",
                original,
                recovered
            );
        }
    }

    #[test]
    fn decode_is_offset_independent() {
        let chunk = encode(&frame(vec![0.25, -0.5, 0.75, -0.125]));

        // Build a larger buffer where the same payload sits at an odd offset.
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&chunk.bytes);
        let odd_view = &shifted[1..];

        let aligned = decode(&chunk.bytes, 24000, 1).unwrap();
        let misaligned = decode(odd_view, 24000, 1).unwrap();
        assert_eq!(aligned.samples, misaligned.samples);
    }

    #[test]
    fn out_of_range_samples_wrap() {
        // 1.0 * 32768 overflows i16 and wraps to -32768; this matches the
        // wire peers' integer cast and must not be "fixed" to saturation.
        let chunk = encode(&frame(vec![1.0]));
        assert_eq!(chunk.bytes, (-32768i16).to_le_bytes());

        let chunk = encode(&frame(vec![-1.0]));
        assert_eq!(chunk.bytes, (-32768i16).to_le_bytes());
    }

    #[test]
    fn encode_empty_frame_is_empty_chunk() {
        let chunk = encode(&frame(vec![]));
        assert!(chunk.bytes.is_empty());
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn odd_byte_length_is_a_chunk_error() {
        let err = decode(&[0x00, 0x01, 0x02], 24000, 1).unwrap_err();
        assert_eq!(err, PcmError::TruncatedSample(3));
    }

    #[test]
    fn zero_rate_is_a_chunk_error() {
        // A zero rate would make the duration math non-finite, which
        // `Duration::from_secs_f64` rejects by panicking. It must be a
        // recoverable per-chunk error instead.
        assert_eq!(decode(&[0x00, 0x00], 0, 1).unwrap_err(), PcmError::InvalidRate(0));
        assert_eq!(decode(&[], 0, 1).unwrap_err(), PcmError::InvalidRate(0));
    }

    #[test]
    fn duration_uses_frames_not_samples() {
        // 48000 interleaved stereo samples = 24000 frames = 1s at 24kHz.
        let bytes = vec![0u8; 48000 * 2];
        let buffer = decode(&bytes, 24000, 2).unwrap();
        assert_eq!(buffer.duration, Duration::from_secs(1));
    }

    #[test]
    fn deinterleave_preserves_channel_order() {
        let interleaved = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let channels = deinterleave(&interleaved, 2).unwrap();
        assert_eq!(channels[0], vec![0.1, 0.3, 0.5]);
        assert_eq!(channels[1], vec![0.2, 0.4, 0.6]);
    }

    #[test]
    fn deinterleave_rejects_ragged_input() {
        assert!(deinterleave(&[0.0; 5], 2).is_err());
    }
}
