use crate::capture::AudioSource;
use crate::config::{ApiConfig, SessionConfig};
use crate::envelope::{self, InboundEvent};
use crate::pcm;
use crate::playback::PlaybackScheduler;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebSocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session is already open")]
    AlreadyOpen,

    #[error("Setup serialization error: {0}")]
    Setup(#[from] serde_json::Error),
}

/// What the transport saw, as data rather than callbacks: the session's
/// receive loop consumes these in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(String),
    Closed,
    Failed(String),
}

#[async_trait::async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, text: String) -> Result<(), SessionError>;
    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait::async_trait]
pub trait TransportStream: Send {
    async fn next(&mut self) -> Option<TransportEvent>;
}

/// One duplex connection, split into an outbound half (owned by the frame
/// pump) and an inbound half (owned by the session's receive loop).
pub trait Transport: Send {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl WsTransport {
    /// Open the duplex WebSocket and send the session-setup message. The
    /// voice identity, transcription toggle and guidance payload are passed
    /// through to the remote endpoint unmodified.
    pub async fn connect(
        api: &ApiConfig,
        session: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut url = Url::parse(&api.endpoint)?;
        url.query_pairs_mut().append_pair("key", api.api_key());

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, read) = ws_stream.split();

        let setup = setup_message(session)?;
        write.send(Message::Text(setup.into())).await?;

        Ok(Self { write, read })
    }
}

/// Session-setup payload for the transport-open call. Guidance is an
/// opaque blob owned by the persona layer; this core never inspects it.
pub fn setup_message(config: &SessionConfig) -> Result<String, SessionError> {
    let setup = json!({
        "setup": {
            "voice": config.voice.to_string(),
            "captureTranscript": config.capture_transcript,
            "guidance": config.guidance,
        }
    });
    Ok(serde_json::to_string(&setup)?)
}

struct WsSender(SplitSink<WsStream, Message>);
struct WsReceiver(SplitStream<WsStream>);

#[async_trait::async_trait]
impl TransportSink for WsSender {
    async fn send(&mut self, text: String) -> Result<(), SessionError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(SessionError::from)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.0.close().await.map_err(SessionError::from)
    }
}

#[async_trait::async_trait]
impl TransportStream for WsReceiver {
    async fn next(&mut self) -> Option<TransportEvent> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(TransportEvent::Message(text.to_string()))
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Remote closed connection: {:?}", frame);
                    return Some(TransportEvent::Closed);
                }
                Some(Ok(Message::Binary(data))) => {
                    log::debug!("Ignoring binary message ({} bytes)", data.len());
                }
                Some(Ok(_)) => {} // ping/pong
                Some(Err(e)) => return Some(TransportEvent::Failed(e.to_string())),
                None => return Some(TransportEvent::Closed),
            }
        }
    }
}

impl Transport for WsTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        (Box::new(WsSender(self.write)), Box::new(WsReceiver(self.read)))
    }
}

/// What happened on the session, surfaced to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Running transcript text for the user's utterance.
    Transcript(String),
    /// An inbound audio chunk was decoded and scheduled for playback.
    AudioScheduled { duration: Duration },
    /// A malformed chunk was skipped; the session continues.
    ChunkSkipped,
    TurnComplete,
    /// Transport-level or remote error; terminal for this session.
    Failed(String),
    /// The output device failed; terminal, capture must still be stopped.
    PlaybackFailed(String),
    Closed,
}

/// One live duplex session: pumps encoded capture frames outward and turns
/// inbound messages into `SessionEvent`s, decoding and scheduling audio
/// inline so playback order always equals arrival order.
pub struct StreamingSession {
    stream: Box<dyn TransportStream>,
    scheduler: PlaybackScheduler,
    output_sample_rate: u32,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl StreamingSession {
    pub fn start(
        transport: Box<dyn Transport>,
        source: Box<dyn AudioSource>,
        scheduler: PlaybackScheduler,
    ) -> Self {
        let (sink_half, stream_half) = transport.split();
        let cancel = CancellationToken::new();
        let output_sample_rate = scheduler.output_sample_rate();

        let pump = tokio::spawn(outbound_pump(sink_half, source, cancel.clone()));

        Self {
            stream: stream_half,
            scheduler,
            output_sample_rate,
            cancel,
            pump: Some(pump),
            closed: false,
        }
    }

    /// Next session event, in strict arrival order. Audio chunks are
    /// decoded and scheduled before this returns; chunk N+1 is not touched
    /// until chunk N has been scheduled. Decode failures are contained per
    /// chunk rather than tearing the session down.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if self.closed {
                return None;
            }
            let event = match self.stream.next().await {
                Some(event) => event,
                None => return Some(SessionEvent::Closed),
            };

            match event {
                TransportEvent::Closed => return Some(SessionEvent::Closed),
                TransportEvent::Failed(cause) => return Some(SessionEvent::Failed(cause)),
                TransportEvent::Message(raw) => match envelope::parse_inbound(&raw) {
                    InboundEvent::TranscriptText(text) => {
                        return Some(SessionEvent::Transcript(text))
                    }
                    InboundEvent::AudioChunk { data, sample_rate } => {
                        return Some(self.handle_audio_chunk(&data, sample_rate).await)
                    }
                    InboundEvent::TurnComplete => return Some(SessionEvent::TurnComplete),
                    InboundEvent::SessionError(cause) => {
                        return Some(SessionEvent::Failed(cause))
                    }
                    InboundEvent::SessionClosed => return Some(SessionEvent::Closed),
                    InboundEvent::Unrecognized(raw) => {
                        log::warn!(
                            "Ignoring unrecognized message ({} bytes): {:.120}",
                            raw.len(),
                            raw
                        );
                        continue;
                    }
                },
            }
        }
    }

    async fn handle_audio_chunk(&mut self, data: &str, sample_rate: Option<u32>) -> SessionEvent {
        let rate = sample_rate.unwrap_or(self.output_sample_rate);

        let bytes = match envelope::decode_payload(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Skipping audio chunk with bad base64 payload: {}", e);
                return SessionEvent::ChunkSkipped;
            }
        };

        let buffer = match pcm::decode(&bytes, rate, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Skipping malformed audio chunk: {}", e);
                return SessionEvent::ChunkSkipped;
            }
        };

        let duration = buffer.duration;
        match self.scheduler.schedule(buffer).await {
            Ok(_) => SessionEvent::AudioScheduled { duration },
            Err(e) => {
                log::error!("Playback scheduling failed: {}", e);
                SessionEvent::PlaybackFailed(e.to_string())
            }
        }
    }

    /// When playback of everything scheduled so far will end.
    pub fn playback_busy_until(&self) -> Instant {
        self.scheduler.busy_until()
    }

    pub fn is_playback_idle(&self) -> bool {
        self.scheduler.is_idle(Instant::now())
    }

    /// Hard stop of playback: discard scheduled-but-not-started buffers.
    pub async fn stop_playback(&mut self) {
        if let Err(e) = self.scheduler.stop().await {
            log::warn!("Playback stop failed: {}", e);
        }
    }

    /// Stop capture, stop playback, tear down the connection. Idempotent
    /// and safe from any state.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                if !e.is_cancelled() {
                    log::warn!("Outbound pump task failed: {}", e);
                }
            }
        }
        self.stop_playback().await;
        log::debug!("Streaming session closed");
    }
}

/// Capture frames, encode, wrap, send: one wire message per frame. The
/// capture callback itself never blocks; frames arrive over a channel and
/// everything slow happens here.
async fn outbound_pump(
    mut transport: Box<dyn TransportSink>,
    mut source: Box<dyn AudioSource>,
    cancel: CancellationToken,
) {
    let mut frames_sent = 0u64;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        let Some(frame) = frame else {
            log::debug!("Capture source drained");
            break;
        };

        let chunk = pcm::encode(&frame);
        let message = envelope::format_outbound(&chunk);
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize outbound frame: {}", e);
                continue;
            }
        };

        if let Err(e) = transport.send(text).await {
            log::warn!("Failed to send frame {}: {}", frames_sent + 1, e);
            break;
        }
        frames_sent += 1;
    }

    source.close();
    let _ = transport.close().await;
    log::debug!("Outbound pump exiting, {} frames sent", frames_sent);
}
