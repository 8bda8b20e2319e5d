use crate::config::{ApiConfig, SessionConfig};
use crate::engine::AudioEngine;
use crate::error::Result;
use crate::playback::PlaybackScheduler;
use crate::session::{SessionError, SessionEvent, StreamingSession, Transport, WsTransport};

/// Controller lifecycle. `Idle` is the only state a new session may be
/// opened from; `Closed` and `Error` are terminal for this controller
/// instance and a retry means constructing a fresh session via `open`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Remote,
}

/// One append-only transcript entry; read-only to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    pub text: String,
}

/// What the host observes from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged(SessionState),
    Transcript(TranscriptEvent),
    /// The remote party finished its utterance; the host's completion hook.
    TurnComplete,
    /// A malformed inbound chunk was skipped; informational only.
    ChunkSkipped,
}

/// Public-facing API over one live session: owns the audio engine, tracks
/// the state machine, and aggregates the running transcript. The capture
/// source and playback scheduler are exclusively owned per session and
/// never exposed.
pub struct SessionController {
    engine: Box<dyn AudioEngine>,
    state: SessionState,
    transcript: Vec<TranscriptEvent>,
    session: Option<StreamingSession>,
    awaiting_drain: bool,
}

impl SessionController {
    pub fn new(engine: Box<dyn AudioEngine>) -> Self {
        Self {
            engine,
            state: SessionState::Idle,
            transcript: Vec::new(),
            session: None,
            awaiting_drain: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transcript(&self) -> &[TranscriptEvent] {
        &self.transcript
    }

    /// Open a live session against the configured endpoint. Rejected (not
    /// queued) unless the controller is `Idle`.
    pub async fn open(&mut self, api: &ApiConfig, config: &SessionConfig) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyOpen.into());
        }
        self.state = SessionState::Connecting;

        let transport = match WsTransport::connect(api, config).await {
            Ok(transport) => Box::new(transport),
            Err(e) => {
                let reason = e.to_string();
                self.state = SessionState::Error(reason);
                return Err(e.into());
            }
        };

        self.attach(config, transport)
    }

    /// `open` with a caller-supplied transport; the seam hosts and tests
    /// use to run the pipeline without a network.
    pub async fn open_with_transport(
        &mut self,
        config: &SessionConfig,
        transport: Box<dyn Transport>,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyOpen.into());
        }
        self.state = SessionState::Connecting;
        self.attach(config, transport)
    }

    fn attach(&mut self, config: &SessionConfig, transport: Box<dyn Transport>) -> Result<()> {
        let source = match self.engine.open_source(config) {
            Ok(source) => source,
            Err(e) => {
                self.state = SessionState::Error(e.to_string());
                return Err(e.into());
            }
        };
        let sink = match self.engine.open_sink(config) {
            Ok(sink) => sink,
            Err(e) => {
                // Source drops here, releasing the capture device.
                self.state = SessionState::Error(e.to_string());
                return Err(e.into());
            }
        };

        let scheduler = PlaybackScheduler::new(sink, config.output_sample_rate);
        self.session = Some(StreamingSession::start(transport, source, scheduler));
        self.awaiting_drain = false;
        self.state = SessionState::Listening;
        log::info!("Session open: listening");
        Ok(())
    }

    /// Next observable event. Drives the state machine: inbound audio moves
    /// `Listening -> Speaking`; once the remote turn is complete and the
    /// playback cursor has drained, `Speaking -> Listening`. Returns `None`
    /// when no session is live.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        loop {
            let event = {
                let session = self.session.as_mut()?;
                if self.awaiting_drain {
                    if session.is_playback_idle() {
                        self.awaiting_drain = false;
                        self.state = SessionState::Listening;
                        return Some(ControllerEvent::StateChanged(SessionState::Listening));
                    }
                    let deadline = tokio::time::Instant::from_std(session.playback_busy_until());
                    // If the timer wins, the in-flight `next_event` future is
                    // dropped. Lossless only while `AudioSink::play` never
                    // yields mid-call (see the trait contract).
                    tokio::select! {
                        event = session.next_event() => event,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.awaiting_drain = false;
                            self.state = SessionState::Listening;
                            return Some(ControllerEvent::StateChanged(SessionState::Listening));
                        }
                    }
                } else {
                    session.next_event().await
                }
            };

            match event {
                None => return None,
                Some(SessionEvent::Transcript(text)) => {
                    let entry = TranscriptEvent {
                        speaker: Speaker::User,
                        text,
                    };
                    self.transcript.push(entry.clone());
                    return Some(ControllerEvent::Transcript(entry));
                }
                Some(SessionEvent::AudioScheduled { .. }) => {
                    // New remote audio also cancels a pending drain-out.
                    self.awaiting_drain = false;
                    if self.state == SessionState::Listening {
                        self.state = SessionState::Speaking;
                        return Some(ControllerEvent::StateChanged(SessionState::Speaking));
                    }
                }
                Some(SessionEvent::ChunkSkipped) => {
                    return Some(ControllerEvent::ChunkSkipped);
                }
                Some(SessionEvent::TurnComplete) => {
                    if self.state == SessionState::Speaking {
                        self.awaiting_drain = true;
                    }
                    return Some(ControllerEvent::TurnComplete);
                }
                Some(SessionEvent::Failed(cause))
                | Some(SessionEvent::PlaybackFailed(cause)) => {
                    // Closing the session stops capture either way, so a
                    // dead output device does not leave the mic running.
                    self.teardown().await;
                    self.state = SessionState::Error(cause.clone());
                    log::error!("Session failed: {}", cause);
                    return Some(ControllerEvent::StateChanged(self.state.clone()));
                }
                Some(SessionEvent::Closed) => {
                    self.teardown().await;
                    self.state = SessionState::Closed;
                    log::info!("Session closed by remote");
                    return Some(ControllerEvent::StateChanged(SessionState::Closed));
                }
            }
        }
    }

    /// User-initiated stop: synchronously halts capture and playback (a
    /// hard cancellation, pending audio is discarded) and returns the
    /// controller to `Idle`. Idempotent from every state, never fails.
    pub async fn stop(&mut self) {
        self.teardown().await;
        match self.state {
            SessionState::Connecting | SessionState::Listening | SessionState::Speaking => {
                self.state = SessionState::Idle;
                log::info!("Session stopped by user");
            }
            _ => {}
        }
    }

    /// Tear down and mark the controller terminally closed. Idempotent from
    /// every state, never fails.
    pub async fn close(&mut self) {
        self.teardown().await;
        if !matches!(self.state, SessionState::Error(_)) {
            self.state = SessionState::Closed;
        }
    }

    async fn teardown(&mut self) {
        self.awaiting_drain = false;
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}
