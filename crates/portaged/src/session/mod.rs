//! Peer sessions — one actor per remote node.
//!
//! A session owns its TcpStream exclusively. It drives the handshake and
//! key exchange, then settles into a loop that serializes outbound writes
//! (FIFO through a bounded command queue), decrypts and dispatches inbound
//! envelopes in wire order, exchanges heartbeats, and tears itself down on
//! socket errors, peer silence, or repeated protocol offenses.

pub mod handshake;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use portage_core::config::NodeConfig;
use portage_core::crypto::{CryptoError, EphemeralKey, Keypair, SessionKey};
use portage_core::envelope::{CodecError, Envelope};
use portage_core::error::{ErrorCode, WireError};
use portage_core::id::{NodeId, PeerAddress};
use portage_core::message::{self, Disconnect, KeyRotation, Message};
use portage_services::{NodeObserver, PeerRecord, PeerRegistry, PeerState};

use crate::dispatch::NodeEvent;
use handshake::{Handshake, Role, Secrets, Step};

/// Protocol offenses tolerated per session within the sliding window
/// before the session is dropped.
const MAX_OFFENSES: usize = 5;
const OFFENSE_WINDOW: Duration = Duration::from_secs(60);

/// Capability strings offered during the handshake.
const CAPABILITIES: &[&str] = &["file-transfer"];

// ── Commands and handle ───────────────────────────────────────────────────────

pub enum SessionCommand {
    Send {
        message: Message,
        correlation: String,
    },
    RotateKey,
    Close {
        reason: String,
    },
}

/// Cheap clonable handle to a session actor. Dropping every handle does
/// not kill the session; an explicit Close or a dead socket does.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Queue a message, waiting for queue space (backpressure by awaiting).
    pub async fn send(
        &self,
        message: Message,
        correlation: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::Send {
                message,
                correlation: correlation.into(),
            })
            .await
            .map_err(|_| SessionError::Gone)
    }

    /// Queue a message without waiting. `Busy` when the outbound queue is
    /// at its limit — producers must back off, the queue never grows.
    pub fn try_send(
        &self,
        message: Message,
        correlation: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.tx
            .try_send(SessionCommand::Send {
                message,
                correlation: correlation.into(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::Busy,
                mpsc::error::TrySendError::Closed(_) => SessionError::Gone,
            })
    }

    /// Ask the session to rotate its key.
    pub fn rotate_key(&self) -> Result<(), SessionError> {
        self.tx
            .try_send(SessionCommand::RotateKey)
            .map_err(|_| SessionError::Gone)
    }

    /// Ask the session to say goodbye and shut down.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.try_send(SessionCommand::Close {
            reason: reason.into(),
        });
    }
}

// ── Offense tracking ──────────────────────────────────────────────────────────

/// Sliding-window counter for per-session protocol offenses.
pub(crate) struct OffenseWindow {
    times: VecDeque<Instant>,
}

impl OffenseWindow {
    fn new() -> Self {
        Self {
            times: VecDeque::new(),
        }
    }

    /// Record an offense; returns how many fall inside the window.
    fn record(&mut self) -> usize {
        let now = Instant::now();
        self.times.push_back(now);
        while let Some(front) = self.times.front() {
            if now.duration_since(*front) > OFFENSE_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }
        self.times.len()
    }
}

// ── Spawning ──────────────────────────────────────────────────────────────────

/// Everything a session needs from its parent, bundled so spawns stay
/// readable.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<NodeConfig>,
    pub keypair: Arc<Keypair>,
    pub local: NodeId,
    pub peers: PeerRegistry,
    pub events: mpsc::Sender<NodeEvent>,
    pub observer: Arc<dyn NodeObserver>,
}

/// Spawn the initiating side of a session (we dialed the peer).
pub fn spawn_initiator(ctx: SessionContext, peer: NodeId, stream: TcpStream) -> SessionHandle {
    spawn(ctx, Some(peer), stream, Role::Initiator)
}

/// Spawn the responding side of a session (the peer dialed us). The peer's
/// node id is learned from its first envelope.
pub fn spawn_responder(ctx: SessionContext, stream: TcpStream) -> SessionHandle {
    spawn(ctx, None, stream, Role::Responder)
}

fn spawn(
    ctx: SessionContext,
    peer: Option<NodeId>,
    stream: TcpStream,
    role: Role,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(ctx.config.network.session_queue_limit);
    let handle = SessionHandle { tx: tx.clone() };

    let peer_addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();

    let session = PeerSession {
        ctx,
        role,
        peer,
        peer_addr,
        self_tx: tx,
        cmd_rx: rx,
        reader,
        writer,
        read_buf: BytesMut::with_capacity(64 * 1024),
        secrets: None,
        prev_key: None,
        pending_rotation: None,
        last_inbound: Instant::now(),
        last_outbound: Instant::now(),
        offenses: OffenseWindow::new(),
        authenticated_once: false,
    };
    tokio::spawn(session.run());
    handle
}

// ── The actor ─────────────────────────────────────────────────────────────────

struct PeerSession {
    ctx: SessionContext,
    role: Role,
    peer: Option<NodeId>,
    peer_addr: Option<SocketAddr>,
    self_tx: mpsc::Sender<SessionCommand>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    secrets: Option<Secrets>,
    /// One key of history, so envelopes sealed just before a rotation
    /// still open.
    prev_key: Option<SessionKey>,
    pending_rotation: Option<EphemeralKey>,
    last_inbound: Instant,
    last_outbound: Instant,
    offenses: OffenseWindow,
    authenticated_once: bool,
}

impl PeerSession {
    async fn run(mut self) {
        let reason = match self.run_inner().await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::debug!(peer = ?self.peer, error = %e, "session ended with error");
                e.to_string()
            }
        };

        if let Some(peer) = self.peer {
            let end_state = if self.authenticated_once {
                PeerState::Disconnected
            } else {
                PeerState::Failed
            };
            if let Some(mut record) = self.ctx.peers.get_mut(&peer) {
                record.mark_disconnected(end_state);
            }
            self.ctx.observer.peer_disconnected(peer, &reason);
            let _ = self
                .ctx
                .events
                .send(NodeEvent::SessionClosed { node: peer, reason })
                .await;
        }
    }

    async fn run_inner(&mut self) -> Result<String, SessionError> {
        let timeout = Duration::from_secs(self.ctx.config.network.handshake_timeout_secs);
        let capabilities = CAPABILITIES.iter().map(|s| s.to_string()).collect();
        let (mut hs, opening) =
            Handshake::start(self.role, self.ctx.keypair.clone(), capabilities);

        self.set_peer_state(hs.phase());
        if let Some(msg) = opening {
            self.write_message(msg, "").await?;
        }

        let secrets = match tokio::time::timeout(timeout, self.drive_handshake(&mut hs)).await {
            Ok(result) => result?,
            Err(_) => {
                // best effort — the peer may already be gone
                let failure = Message::HandshakeFailure(message::HandshakeFailure {
                    code: ErrorCode::Timeout.code(),
                    reason: "handshake timed out".into(),
                });
                let _ = self.write_message(failure, "").await;
                return Err(SessionError::Handshake("handshake timed out".into()));
            }
        };
        self.secrets = Some(*secrets);
        self.authenticated_once = true;

        let peer = self.peer.ok_or_else(|| {
            SessionError::Handshake("handshake completed without a peer identity".into())
        })?;
        if let Some(mut record) = self.ctx.peers.get_mut(&peer) {
            record.mark_authenticated();
        }
        self.ctx.observer.peer_authenticated(peer);
        let _ = self
            .ctx
            .events
            .send(NodeEvent::SessionEstablished {
                node: peer,
                handle: SessionHandle {
                    tx: self.self_tx.clone(),
                },
            })
            .await;
        tracing::info!(%peer, role = ?self.role, "session authenticated");

        self.main_loop().await
    }

    /// Pump envelopes through the handshake machine until a key appears.
    async fn drive_handshake(&mut self, hs: &mut Handshake) -> Result<Box<Secrets>, SessionError> {
        loop {
            let envelope = match self.read_envelope().await? {
                Some(envelope) => envelope,
                None => return Err(SessionError::Handshake("peer closed during handshake".into())),
            };
            self.learn_peer(&envelope);

            let msg = Message::from_envelope(&envelope)
                .map_err(|e| SessionError::Handshake(format!("bad handshake payload: {e}")))?;

            match hs.on_message(msg) {
                Step::Send(out) => {
                    self.set_peer_state(hs.phase());
                    for msg in out {
                        self.write_message(msg, "").await?;
                    }
                }
                Step::SendAndFinish(out, secrets) => {
                    for msg in out {
                        self.write_message(msg, "").await?;
                    }
                    return Ok(secrets);
                }
                Step::Finish(secrets) => return Ok(secrets),
                Step::Fail { notify, reason } => {
                    if let Some(msg) = notify {
                        let _ = self.write_message(msg, "").await;
                    }
                    self.set_peer_state(PeerState::Failed);
                    return Err(SessionError::Handshake(reason));
                }
            }
        }
    }

    async fn main_loop(&mut self) -> Result<String, SessionError> {
        let heartbeat = Duration::from_secs(self.ctx.config.network.heartbeat_interval_secs);
        let mut ticker = tokio::time::interval(heartbeat / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => return Ok("all session handles dropped".into()),
                        Some(SessionCommand::Send { message, correlation }) => {
                            self.write_message(message, &correlation).await?;
                        }
                        Some(SessionCommand::RotateKey) => {
                            self.start_rotation().await?;
                        }
                        Some(SessionCommand::Close { reason }) => {
                            let goodbye = Message::Disconnect(Disconnect {
                                reason: reason.clone(),
                            });
                            let _ = self.write_message(goodbye, "").await;
                            return Ok(reason);
                        }
                    }
                }

                read = self.reader.read_buf(&mut self.read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok("peer closed connection".into());
                    }
                    loop {
                        match Envelope::decode_from(&mut self.read_buf) {
                            Ok(Some(envelope)) => {
                                if let Some(reason) = self.handle_envelope(envelope).await? {
                                    return Ok(reason);
                                }
                            }
                            Ok(None) => break,
                            // framing is lost — there is no way to resync a
                            // byte stream, so the session ends
                            Err(e) => {
                                self.report_protocol_error(ErrorCode::BadFraming, &e.to_string())
                                    .await;
                                return Err(SessionError::Codec(e));
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    if self.last_inbound.elapsed() >= heartbeat * 3 {
                        return Ok("timeout".into());
                    }
                    if self.last_outbound.elapsed() >= heartbeat {
                        self.write_message(Message::Heartbeat, "").await?;
                    }
                }
            }
        }
    }

    /// Process one inbound envelope. `Some(reason)` closes the session
    /// gracefully.
    async fn handle_envelope(&mut self, mut envelope: Envelope) -> Result<Option<String>, SessionError> {
        self.last_inbound = Instant::now();

        if message::validate_timestamp(envelope.timestamp_ticks).is_err() {
            return self
                .offense(ErrorCode::InvalidMessage, "envelope timestamp outside skew window")
                .await;
        }

        // Sealed payloads open under the current key, falling back to the
        // previous one around a rotation.
        if message::type_requires_encryption(&envelope.message_type) {
            let opened = match &self.secrets {
                Some(secrets) => secrets.key.open(&envelope.payload).or_else(|e| {
                    self.prev_key
                        .as_ref()
                        .map(|k| k.open(&envelope.payload))
                        .unwrap_or(Err(e))
                }),
                None => Err(CryptoError::Open),
            };
            match opened {
                Ok(plain) => envelope.payload = Bytes::from(plain),
                Err(_) => {
                    return self
                        .offense(ErrorCode::NotAuthenticated, "sealed payload failed to open")
                        .await;
                }
            }
        }

        let msg = match Message::from_envelope(&envelope) {
            Ok(msg) => msg,
            Err(e) => {
                let code = match e {
                    message::MessageError::UnknownType(_) => ErrorCode::UnknownMessageType,
                    _ => ErrorCode::InvalidMessage,
                };
                return self.offense(code, &e.to_string()).await;
            }
        };

        match msg {
            Message::Heartbeat => Ok(None),
            Message::Disconnect(d) => Ok(Some(format!("peer disconnected: {}", d.reason))),
            Message::KeyRotation(r) => {
                self.handle_rotation(r).await?;
                Ok(None)
            }
            Message::HandshakeRequest(_)
            | Message::HandshakeResponse(_)
            | Message::HandshakeAck(_)
            | Message::KeyExchangeInit(_)
            | Message::KeyExchangeResponse(_)
            | Message::KeyExchangeComplete(_) => {
                self.offense(
                    ErrorCode::HandshakeFailed,
                    "handshake message on an authenticated session",
                )
                .await
            }
            Message::HandshakeFailure(f) => Ok(Some(format!("peer reported failure: {}", f.reason))),
            msg => {
                let from = self.peer.ok_or(SessionError::NotAuthenticated)?;
                let _ = self
                    .ctx
                    .events
                    .send(NodeEvent::Inbound {
                        from,
                        message_id: envelope.message_id,
                        correlation: envelope.correlation,
                        message: msg,
                    })
                    .await;
                Ok(None)
            }
        }
    }

    // ── Key rotation ─────────────────────────────────────────────────────────

    /// Begin a rotation: send fresh ephemeral params sealed under the
    /// current key, then wait for the peer's params.
    async fn start_rotation(&mut self) -> Result<(), SessionError> {
        if self.pending_rotation.is_some() {
            return Ok(());
        }
        let eph = EphemeralKey::generate();
        let params = eph.public.to_vec();
        self.pending_rotation = Some(eph);
        self.write_message(Message::KeyRotation(KeyRotation { new_params: params }), "")
            .await
    }

    /// Peer sent rotation params. If we initiated, this is the answer;
    /// otherwise reply with our own params (still under the old key),
    /// then install the new key. Simultaneous initiation converges: both
    /// sides end up agreeing over the same ephemeral pair.
    async fn handle_rotation(&mut self, rotation: KeyRotation) -> Result<(), SessionError> {
        let dh = match self.pending_rotation.take() {
            Some(eph) => eph.agree(&rotation.new_params)?,
            None => {
                let eph = EphemeralKey::generate();
                let params = eph.public.to_vec();
                let dh = eph.agree(&rotation.new_params)?;
                self.write_message(
                    Message::KeyRotation(KeyRotation { new_params: params }),
                    "",
                )
                .await?;
                dh
            }
        };

        let secrets = self.secrets.as_mut().ok_or(SessionError::NotAuthenticated)?;
        let new_key = secrets.rederive(&dh)?;
        let old = std::mem::replace(&mut secrets.key, new_key);
        self.prev_key = Some(old);
        tracing::debug!(peer = ?self.peer, "session key rotated");
        Ok(())
    }

    // ── Plumbing ─────────────────────────────────────────────────────────────

    /// Encode, seal if the type calls for it, and write one message.
    async fn write_message(
        &mut self,
        message: Message,
        correlation: &str,
    ) -> Result<(), SessionError> {
        let needs_seal = message.requires_encryption();
        let mut envelope = message
            .into_envelope(&self.ctx.local, self.peer.as_ref(), correlation)
            .map_err(|e| SessionError::Message(e.to_string()))?;

        if needs_seal {
            let secrets = self.secrets.as_mut().ok_or(SessionError::NotAuthenticated)?;
            let sealed = secrets.key.seal(&envelope.payload)?;
            envelope.payload = Bytes::from(sealed);
        }

        let bytes = envelope.encode()?;
        self.writer.write_all(&bytes).await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    /// Read one whole envelope, buffering as needed. `None` on clean EOF.
    async fn read_envelope(&mut self) -> Result<Option<Envelope>, SessionError> {
        loop {
            if let Some(envelope) = Envelope::decode_from(&mut self.read_buf)? {
                return Ok(Some(envelope));
            }
            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Learn the responder-side peer identity from the first envelope.
    fn learn_peer(&mut self, envelope: &Envelope) {
        if self.peer.is_some() {
            return;
        }
        let Ok(node) = envelope.source.parse::<NodeId>() else {
            return;
        };
        self.peer = Some(node);
        let address = self
            .peer_addr
            .map(|a| PeerAddress::new(a.ip().to_string(), a.port()))
            .unwrap_or_else(|| PeerAddress::new("unknown", 0));
        self.ctx
            .peers
            .entry(node)
            .or_insert_with(|| PeerRecord::new(node, address))
            .state = PeerState::Handshaking;
    }

    fn set_peer_state(&self, state: PeerState) {
        if let Some(peer) = self.peer {
            if let Some(mut record) = self.ctx.peers.get_mut(&peer) {
                record.state = state;
            }
        }
    }

    /// Count a protocol offense, answer with an Error message, and drop
    /// the session once the peer has worn out its welcome.
    async fn offense(
        &mut self,
        code: ErrorCode,
        detail: &str,
    ) -> Result<Option<String>, SessionError> {
        self.report_protocol_error(code, detail).await;
        if self.offenses.record() > MAX_OFFENSES {
            return Ok(Some("too many protocol errors".into()));
        }
        Ok(None)
    }

    async fn report_protocol_error(&mut self, code: ErrorCode, detail: &str) {
        tracing::warn!(peer = ?self.peer, code = code.code(), detail, "protocol error");
        self.ctx
            .observer
            .protocol_error(self.peer, code.code(), detail);
        let reply = Message::Error(WireError::new(code, detail));
        let _ = self.write_message(reply, "").await;
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Outbound queue is full — back off and retry.
    #[error("session outbound queue is full")]
    Busy,

    /// The session actor is gone.
    #[error("session is closed")]
    Gone,

    #[error("session not authenticated")]
    NotAuthenticated,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("message error: {0}")]
    Message(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
