//! End-to-end pipeline tests over a mock audio engine and a channel-backed
//! transport: no audio hardware, no network.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use duplex_voice::capture::{AudioSource, CaptureError};
use duplex_voice::controller::{ControllerEvent, SessionController, SessionState};
use duplex_voice::engine::AudioEngine;
use duplex_voice::pcm::{self, AudioFrame, PlaybackBuffer};
use duplex_voice::playback::{AudioSink, PlaybackError, PlaybackScheduler};
use duplex_voice::session::{
    SessionError, SessionEvent, StreamingSession, Transport, TransportEvent, TransportSink,
    TransportStream,
};
use duplex_voice::SessionConfig;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// ---- mock transport -------------------------------------------------------

struct MockSink {
    sent: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), SessionError> {
        self.sent
            .send(text)
            .map_err(|e| SessionError::Connection(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct MockStream {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait::async_trait]
impl TransportStream for MockStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

struct MockTransport {
    sent: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl MockTransport {
    fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                sent: sent_tx,
                inbound: inbound_rx,
            },
            sent_rx,
            inbound_tx,
        )
    }
}

impl Transport for MockTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        (
            Box::new(MockSink { sent: self.sent }),
            Box::new(MockStream {
                inbound: self.inbound,
            }),
        )
    }
}

// ---- mock audio engine ----------------------------------------------------

struct ScriptedSource {
    frames: Vec<AudioFrame>,
}

#[async_trait::async_trait]
impl AudioSource for ScriptedSource {
    async fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.frames.is_empty() {
            // A live microphone never returns; it just goes quiet.
            std::future::pending().await
        } else {
            Some(self.frames.remove(0))
        }
    }

    fn close(&mut self) {}
}

#[derive(Default, Clone)]
struct RecordingSink {
    played: Arc<Mutex<Vec<Duration>>>,
    stops: Arc<Mutex<usize>>,
}

#[async_trait::async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, buffer: &PlaybackBuffer) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push(buffer.duration);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlaybackError> {
        *self.stops.lock().unwrap() += 1;
        Ok(())
    }
}

struct MockEngine {
    frames: Mutex<Vec<AudioFrame>>,
    sink: RecordingSink,
}

impl MockEngine {
    fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames: Mutex::new(frames),
            sink: RecordingSink::default(),
        }
    }
}

impl AudioEngine for MockEngine {
    fn open_source(&self, _config: &SessionConfig) -> Result<Box<dyn AudioSource>, CaptureError> {
        Ok(Box::new(ScriptedSource {
            frames: std::mem::take(&mut *self.frames.lock().unwrap()),
        }))
    }

    fn open_sink(&self, _config: &SessionConfig) -> Result<Box<dyn AudioSink>, PlaybackError> {
        Ok(Box::new(self.sink.clone()))
    }
}

// ---- helpers --------------------------------------------------------------

fn capture_frame(value: f32) -> AudioFrame {
    AudioFrame::mono(vec![value; 4096], 16000)
}

fn audio_chunk_message(duration_ms: u64) -> TransportEvent {
    let samples = vec![0.1f32; (24000 * duration_ms / 1000) as usize];
    let chunk = pcm::encode(&AudioFrame::mono(samples, 24000));
    TransportEvent::Message(format!(
        r#"{{"inlineData":{{"data":"{}","mimeType":"audio/pcm;rate=24000"}}}}"#,
        BASE64.encode(&chunk.bytes)
    ))
}

// ---- scenarios ------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn three_frames_produce_exactly_three_wire_messages() {
    let (transport, mut sent, _inbound) = MockTransport::pair();
    let sink = RecordingSink::default();
    let scheduler = PlaybackScheduler::new(Box::new(sink), 24000);
    let source = ScriptedSource {
        frames: vec![capture_frame(0.0), capture_frame(0.1), capture_frame(0.2)],
    };
    let mut session = StreamingSession::start(Box::new(transport), Box::new(source), scheduler);

    for n in 1..=3 {
        let raw = sent.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value["media"]["mimeType"], "audio/pcm;rate=16000",
            "frame {} has wrong mime tag",
            n
        );
        // 4096 samples * 2 bytes, base64-decoded.
        let payload = BASE64
            .decode(value["media"]["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload.len(), 4096 * 2);
    }

    // Exactly three: the source has gone quiet, nothing else is sent.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sent.try_recv().is_err());

    session.close().await;
}

#[test_log::test(tokio::test)]
async fn two_inbound_chunks_advance_cursor_by_their_exact_sum() {
    let (transport, _sent, inbound) = MockTransport::pair();
    let sink = RecordingSink::default();
    let scheduler = PlaybackScheduler::new(Box::new(sink.clone()), 24000);
    let source = ScriptedSource { frames: vec![] };
    let mut session = StreamingSession::start(Box::new(transport), Box::new(source), scheduler);

    inbound.send(audio_chunk_message(500)).unwrap();
    inbound.send(audio_chunk_message(250)).unwrap();

    let before = Instant::now();
    let first = session.next_event().await.unwrap();
    let busy_after_first = session.playback_busy_until();
    let second = session.next_event().await.unwrap();
    let busy_after_second = session.playback_busy_until();

    assert_eq!(
        first,
        SessionEvent::AudioScheduled {
            duration: Duration::from_millis(500)
        }
    );
    assert_eq!(
        second,
        SessionEvent::AudioScheduled {
            duration: Duration::from_millis(250)
        }
    );

    // Chunk 2 extends the timeline by exactly its duration: no gap, no
    // overlap, regardless of how quickly it arrived behind chunk 1.
    assert_eq!(busy_after_second - busy_after_first, Duration::from_millis(250));

    // And chunk 1 started at schedule time, not somewhere in the past.
    let total = busy_after_second - before;
    assert!(total >= Duration::from_millis(750));
    assert!(total < Duration::from_millis(1750), "cursor drifted: {:?}", total);

    assert_eq!(
        *sink.played.lock().unwrap(),
        vec![Duration::from_millis(500), Duration::from_millis(250)]
    );

    session.close().await;
}

#[test_log::test(tokio::test)]
async fn full_conversation_walk() {
    let engine = MockEngine::new(vec![capture_frame(0.0)]);
    let sink = engine.sink.clone();
    let mut controller = SessionController::new(Box::new(engine));

    let (transport, mut sent, inbound) = MockTransport::pair();
    controller
        .open_with_transport(&SessionConfig::default(), Box::new(transport))
        .await
        .unwrap();
    assert_eq!(*controller.state(), SessionState::Listening);

    // The captured frame goes out while we interact.
    let outbound = sent.recv().await.unwrap();
    assert!(outbound.contains("audio/pcm;rate=16000"));

    inbound
        .send(TransportEvent::Message(
            r#"{"transcript":{"text":"what is a filibuster"}}"#.into(),
        ))
        .unwrap();
    inbound.send(audio_chunk_message(40)).unwrap();
    inbound
        .send(TransportEvent::Message(r#"{"turnComplete":true}"#.into()))
        .unwrap();

    let mut saw_turn_complete = false;
    loop {
        match controller.next_event().await.unwrap() {
            ControllerEvent::TurnComplete => saw_turn_complete = true,
            ControllerEvent::StateChanged(SessionState::Listening) => break,
            ControllerEvent::StateChanged(SessionState::Speaking)
            | ControllerEvent::Transcript(_) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(saw_turn_complete);
    assert_eq!(controller.transcript().len(), 1);
    assert_eq!(controller.transcript()[0].text, "what is a filibuster");

    controller.stop().await;
    assert_eq!(*controller.state(), SessionState::Idle);
    // Stop is a hard cancellation: the sink was told to drop its queue.
    assert!(*sink.stops.lock().unwrap() >= 1);
}

#[test_log::test(tokio::test)]
async fn stop_mid_playback_discards_pending_audio() {
    let engine = MockEngine::new(vec![]);
    let sink = engine.sink.clone();
    let mut controller = SessionController::new(Box::new(engine));

    let (transport, _sent, inbound) = MockTransport::pair();
    controller
        .open_with_transport(&SessionConfig::default(), Box::new(transport))
        .await
        .unwrap();

    // Two long buffers queue up; we stop while the first would still be
    // playing.
    inbound.send(audio_chunk_message(500)).unwrap();
    inbound.send(audio_chunk_message(500)).unwrap();
    assert_eq!(
        controller.next_event().await,
        Some(ControllerEvent::StateChanged(SessionState::Speaking))
    );

    controller.stop().await;
    assert_eq!(*controller.state(), SessionState::Idle);
    assert!(*sink.stops.lock().unwrap() >= 1);

    // No further events: the session is gone, nothing stale plays later.
    assert_eq!(controller.next_event().await, None);
}

#[test_log::test(tokio::test)]
async fn decode_failure_does_not_silence_the_conversation() {
    let engine = MockEngine::new(vec![]);
    let sink = engine.sink.clone();
    let mut controller = SessionController::new(Box::new(engine));

    let (transport, _sent, inbound) = MockTransport::pair();
    controller
        .open_with_transport(&SessionConfig::default(), Box::new(transport))
        .await
        .unwrap();

    // Odd byte count: malformed after alignment correction.
    inbound
        .send(TransportEvent::Message(format!(
            r#"{{"inlineData":{{"data":"{}","mimeType":"audio/pcm;rate=24000"}}}}"#,
            BASE64.encode([0u8, 1, 2])
        )))
        .unwrap();
    inbound.send(audio_chunk_message(40)).unwrap();

    assert_eq!(
        controller.next_event().await,
        Some(ControllerEvent::ChunkSkipped)
    );
    // The next well-formed chunk still plays.
    assert_eq!(
        controller.next_event().await,
        Some(ControllerEvent::StateChanged(SessionState::Speaking))
    );
    assert_eq!(sink.played.lock().unwrap().len(), 1);

    controller.stop().await;
}

#[test_log::test(tokio::test)]
async fn mid_stream_disconnect_is_terminal_but_quiet() {
    let engine = MockEngine::new(vec![]);
    let mut controller = SessionController::new(Box::new(engine));

    let (transport, _sent, inbound) = MockTransport::pair();
    controller
        .open_with_transport(&SessionConfig::default(), Box::new(transport))
        .await
        .unwrap();

    inbound
        .send(TransportEvent::Failed("connection reset by peer".into()))
        .unwrap();

    match controller.next_event().await {
        Some(ControllerEvent::StateChanged(SessionState::Error(reason))) => {
            assert!(reason.contains("connection reset"));
        }
        other => panic!("expected terminal error, got {:?}", other),
    }

    // Terminal: no auto-reconnect, and stop/close remain safe.
    controller.stop().await;
    controller.close().await;
    assert!(matches!(controller.state(), SessionState::Error(_)));
}

#[test_log::test(tokio::test)]
async fn independent_controllers_coexist() {
    // Two controllers with their own engines and transports: nothing is
    // process-global.
    let mut first = SessionController::new(Box::new(MockEngine::new(vec![])));
    let mut second = SessionController::new(Box::new(MockEngine::new(vec![])));

    let (transport_a, _sent_a, inbound_a) = MockTransport::pair();
    let (transport_b, _sent_b, _inbound_b) = MockTransport::pair();

    first
        .open_with_transport(&SessionConfig::default(), Box::new(transport_a))
        .await
        .unwrap();
    second
        .open_with_transport(&SessionConfig::default(), Box::new(transport_b))
        .await
        .unwrap();

    inbound_a.send(audio_chunk_message(40)).unwrap();
    assert_eq!(
        first.next_event().await,
        Some(ControllerEvent::StateChanged(SessionState::Speaking))
    );
    // The other controller is untouched.
    assert_eq!(*second.state(), SessionState::Listening);

    first.stop().await;
    second.stop().await;
}
