//! Handshake and key-exchange state machine.
//!
//! Pure message-in/message-out logic with no sockets, so both roles can be
//! driven against each other in tests. The session actor owns the I/O.
//!
//! Wire flow (initiator left, responder right):
//!
//! ```text
//! HandshakeRequest{nonceA, version, caps}   ──►
//!                                           ◄──  HandshakeResponse{nonceB, version, staticB}
//! HandshakeAck{staticA}                     ──►
//! KeyExchangeInit{ephA}                     ──►
//!                                           ◄──  KeyExchangeResponse{ephB}
//! KeyExchangeComplete{tag}                  ──►
//! ```
//!
//! Both sides derive `key = HKDF(dh(ephA, ephB), nonceA ‖ nonceB,
//! staticA ‖ staticB)`. The Complete tag proves the initiator derived the
//! same key before either side seals a payload.

use std::sync::Arc;

use portage_core::crypto::{
    derive_session_key, generate_nonce, EphemeralKey, Keypair, SessionKey,
};
use portage_core::error::ErrorCode;
use portage_core::message::{
    HandshakeAck, HandshakeFailure, HandshakeRequest, HandshakeResponse, KeyExchange, Message,
};
use portage_core::PROTOCOL_VERSION;
use portage_services::PeerState;

/// Which end of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What the session actor should do after feeding a message in.
pub enum Step {
    /// Write these messages and keep waiting.
    Send(Vec<Message>),
    /// Write these messages; the handshake is complete.
    SendAndFinish(Vec<Message>, Box<Secrets>),
    /// The handshake is complete, nothing to write.
    Finish(Box<Secrets>),
    /// Write the failure (if any) and tear the session down.
    Fail {
        notify: Option<Message>,
        reason: String,
    },
}

/// Everything a session needs after authentication: the key plus the
/// material required to re-derive on key rotation.
pub struct Secrets {
    pub key: SessionKey,
    pub nonce_a: Vec<u8>,
    pub nonce_b: Vec<u8>,
    /// staticA ‖ staticB, the HKDF info binding.
    pub info: Vec<u8>,
}

impl Secrets {
    /// Derive a replacement key from a fresh ephemeral agreement, keeping
    /// the original handshake binding.
    pub fn rederive(&self, dh: &[u8; 32]) -> Result<SessionKey, portage_core::crypto::CryptoError> {
        derive_session_key(dh, &self.nonce_a, &self.nonce_b, &self.info)
    }
}

#[derive(Clone, Copy)]
enum State {
    // initiator
    AwaitResponse,
    AwaitKeyResponse,
    // responder
    AwaitRequest,
    AwaitAck,
    AwaitKeyInit,
    AwaitComplete,
    // both
    Done,
    Failed,
}

pub struct Handshake {
    role: Role,
    keypair: Arc<Keypair>,
    state: State,
    nonce_a: Vec<u8>,
    nonce_b: Vec<u8>,
    peer_static: Vec<u8>,
    ephemeral: Option<EphemeralKey>,
    /// Responder holds the derived key while waiting for the Complete tag.
    pending: Option<Box<Secrets>>,
}

impl Handshake {
    /// Begin a handshake. The initiator also gets the opening
    /// HandshakeRequest to write.
    pub fn start(role: Role, keypair: Arc<Keypair>, capabilities: Vec<String>) -> (Self, Option<Message>) {
        match role {
            Role::Initiator => {
                let nonce_a = generate_nonce().to_vec();
                let request = Message::HandshakeRequest(HandshakeRequest {
                    nonce_a: nonce_a.clone(),
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities,
                });
                (
                    Self {
                        role,
                        keypair,
                        state: State::AwaitResponse,
                        nonce_a,
                        nonce_b: Vec::new(),
                        peer_static: Vec::new(),
                        ephemeral: None,
                        pending: None,
                    },
                    Some(request),
                )
            }
            Role::Responder => (
                Self {
                    role,
                    keypair,
                    state: State::AwaitRequest,
                    nonce_a: Vec::new(),
                    nonce_b: Vec::new(),
                    peer_static: Vec::new(),
                    ephemeral: None,
                    pending: None,
                },
                None,
            ),
        }
    }

    /// Which peer-state the session is in right now.
    pub fn phase(&self) -> PeerState {
        match self.state {
            State::AwaitResponse | State::AwaitRequest | State::AwaitAck => PeerState::Handshaking,
            State::AwaitKeyResponse | State::AwaitKeyInit | State::AwaitComplete => {
                PeerState::KeyExchanging
            }
            State::Done => PeerState::Authenticated,
            State::Failed => PeerState::Failed,
        }
    }

    /// Feed one inbound message. Any message other than the expected one
    /// fails the handshake.
    pub fn on_message(&mut self, message: Message) -> Step {
        match (self.state, message) {
            // ── responder path ──────────────────────────────────────────────
            (State::AwaitRequest, Message::HandshakeRequest(req)) => {
                if req.protocol_version != PROTOCOL_VERSION {
                    return self.fail_with(
                        ErrorCode::VersionMismatch,
                        format!(
                            "peer speaks {}, this node speaks {}",
                            req.protocol_version, PROTOCOL_VERSION
                        ),
                    );
                }
                self.nonce_a = req.nonce_a;
                self.nonce_b = generate_nonce().to_vec();
                self.state = State::AwaitAck;
                Step::Send(vec![Message::HandshakeResponse(HandshakeResponse {
                    nonce_b: self.nonce_b.clone(),
                    protocol_version_accepted: PROTOCOL_VERSION.to_string(),
                    public_params: self.keypair.public.to_vec(),
                })])
            }
            (State::AwaitAck, Message::HandshakeAck(ack)) => {
                self.peer_static = ack.public_params;
                self.state = State::AwaitKeyInit;
                Step::Send(Vec::new())
            }
            (State::AwaitKeyInit, Message::KeyExchangeInit(init)) => {
                let eph = EphemeralKey::generate();
                let eph_public = eph.public;
                let dh = match eph.agree(&init.ephemeral_params) {
                    Ok(dh) => dh,
                    Err(e) => {
                        return self.fail_with(ErrorCode::HandshakeFailed, e.to_string());
                    }
                };
                // info binds both identities: initiator's static first
                let mut info = self.peer_static.clone();
                info.extend_from_slice(&self.keypair.public);
                let key = match derive_session_key(&dh, &self.nonce_a, &self.nonce_b, &info) {
                    Ok(key) => key,
                    Err(e) => {
                        return self.fail_with(ErrorCode::HandshakeFailed, e.to_string());
                    }
                };
                self.pending = Some(Box::new(Secrets {
                    key,
                    nonce_a: self.nonce_a.clone(),
                    nonce_b: self.nonce_b.clone(),
                    info,
                }));
                self.state = State::AwaitComplete;
                Step::Send(vec![Message::KeyExchangeResponse(KeyExchange {
                    ephemeral_params: eph_public.to_vec(),
                })])
            }
            (State::AwaitComplete, Message::KeyExchangeComplete(complete)) => {
                let Some(secrets) = self.pending.take() else {
                    return self.fail_with(
                        ErrorCode::HandshakeFailed,
                        "no derived key awaiting confirmation".to_string(),
                    );
                };
                if !secrets.key.verify_confirmation(
                    &complete.ephemeral_params,
                    &secrets.nonce_a,
                    &secrets.nonce_b,
                ) {
                    return self.fail_with(
                        ErrorCode::HandshakeFailed,
                        "key confirmation tag mismatch".to_string(),
                    );
                }
                self.state = State::Done;
                Step::Finish(secrets)
            }

            // ── initiator path ──────────────────────────────────────────────
            (State::AwaitResponse, Message::HandshakeResponse(resp)) => {
                if resp.protocol_version_accepted != PROTOCOL_VERSION {
                    return self.fail_with(
                        ErrorCode::VersionMismatch,
                        format!("peer accepted {}", resp.protocol_version_accepted),
                    );
                }
                self.nonce_b = resp.nonce_b;
                self.peer_static = resp.public_params;

                let eph = EphemeralKey::generate();
                let eph_public = eph.public;
                self.ephemeral = Some(eph);
                self.state = State::AwaitKeyResponse;
                Step::Send(vec![
                    Message::HandshakeAck(HandshakeAck {
                        public_params: self.keypair.public.to_vec(),
                    }),
                    Message::KeyExchangeInit(KeyExchange {
                        ephemeral_params: eph_public.to_vec(),
                    }),
                ])
            }
            (State::AwaitKeyResponse, Message::KeyExchangeResponse(resp)) => {
                let Some(eph) = self.ephemeral.take() else {
                    return self.fail_with(
                        ErrorCode::HandshakeFailed,
                        "no ephemeral awaiting key response".to_string(),
                    );
                };
                let dh = match eph.agree(&resp.ephemeral_params) {
                    Ok(dh) => dh,
                    Err(e) => {
                        return self.fail_with(ErrorCode::HandshakeFailed, e.to_string());
                    }
                };
                let mut info = self.keypair.public.to_vec();
                info.extend_from_slice(&self.peer_static);
                let key = match derive_session_key(&dh, &self.nonce_a, &self.nonce_b, &info) {
                    Ok(key) => key,
                    Err(e) => {
                        return self.fail_with(ErrorCode::HandshakeFailed, e.to_string());
                    }
                };
                let tag = key.confirmation_tag(&self.nonce_a, &self.nonce_b);
                let secrets = Box::new(Secrets {
                    key,
                    nonce_a: self.nonce_a.clone(),
                    nonce_b: self.nonce_b.clone(),
                    info,
                });
                self.state = State::Done;
                Step::SendAndFinish(
                    vec![Message::KeyExchangeComplete(KeyExchange {
                        ephemeral_params: tag,
                    })],
                    secrets,
                )
            }

            // ── failure from the peer ───────────────────────────────────────
            (_, Message::HandshakeFailure(f)) => {
                self.state = State::Failed;
                Step::Fail {
                    notify: None,
                    reason: format!("peer refused handshake ({}): {}", f.code, f.reason),
                }
            }

            // ── anything else is a protocol violation ───────────────────────
            (_, other) => self.fail_with(
                ErrorCode::HandshakeFailed,
                format!("unexpected {} during handshake", other.message_type()),
            ),
        }
    }

    /// Fail the handshake, telling the peer why.
    fn fail_with(&mut self, code: ErrorCode, reason: String) -> Step {
        self.state = State::Failed;
        Step::Fail {
            notify: Some(Message::HandshakeFailure(HandshakeFailure {
                code: code.code(),
                reason: reason.clone(),
            })),
            reason,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive both roles against each other until completion.
    fn run_to_completion() -> (Box<Secrets>, Box<Secrets>) {
        let kp_i = Arc::new(Keypair::generate());
        let kp_r = Arc::new(Keypair::generate());

        let (mut initiator, first) = Handshake::start(Role::Initiator, kp_i, vec![]);
        let (mut responder, none) = Handshake::start(Role::Responder, kp_r, vec![]);
        assert!(none.is_none());

        let mut to_responder = vec![first.unwrap()];
        let mut to_initiator: Vec<Message> = Vec::new();
        let mut secrets_i = None;
        let mut secrets_r = None;

        for _ in 0..8 {
            for msg in std::mem::take(&mut to_responder) {
                match responder.on_message(msg) {
                    Step::Send(out) => to_initiator.extend(out),
                    Step::SendAndFinish(out, s) => {
                        to_initiator.extend(out);
                        secrets_r = Some(s);
                    }
                    Step::Finish(s) => secrets_r = Some(s),
                    Step::Fail { reason, .. } => panic!("responder failed: {reason}"),
                }
            }
            for msg in std::mem::take(&mut to_initiator) {
                match initiator.on_message(msg) {
                    Step::Send(out) => to_responder.extend(out),
                    Step::SendAndFinish(out, s) => {
                        to_responder.extend(out);
                        secrets_i = Some(s);
                    }
                    Step::Finish(s) => secrets_i = Some(s),
                    Step::Fail { reason, .. } => panic!("initiator failed: {reason}"),
                }
            }
            if secrets_i.is_some() && secrets_r.is_some() && to_responder.is_empty() {
                break;
            }
        }

        (secrets_i.unwrap(), secrets_r.unwrap())
    }

    #[test]
    fn full_handshake_derives_matching_keys() {
        let (mut i, r) = run_to_completion();
        let sealed = i.key.seal(b"first sealed payload").unwrap();
        assert_eq!(r.key.open(&sealed).unwrap(), b"first sealed payload");
        assert_eq!(i.nonce_a, r.nonce_a);
        assert_eq!(i.nonce_b, r.nonce_b);
        assert_eq!(i.info, r.info);
    }

    #[test]
    fn phases_progress_through_key_exchange() {
        let kp_i = Arc::new(Keypair::generate());
        let kp_r = Arc::new(Keypair::generate());
        let (mut initiator, first) = Handshake::start(Role::Initiator, kp_i, vec![]);
        let (mut responder, _) = Handshake::start(Role::Responder, kp_r, vec![]);

        assert_eq!(initiator.phase(), PeerState::Handshaking);
        assert_eq!(responder.phase(), PeerState::Handshaking);

        let Step::Send(out) = responder.on_message(first.unwrap()) else {
            panic!("expected Send");
        };
        let Step::Send(to_resp) = initiator.on_message(out.into_iter().next().unwrap()) else {
            panic!("expected Send");
        };
        assert_eq!(initiator.phase(), PeerState::KeyExchanging);
        // responder sees Ack then KeyExchangeInit
        let mut iter = to_resp.into_iter();
        responder.on_message(iter.next().unwrap());
        assert_eq!(responder.phase(), PeerState::KeyExchanging);
    }

    #[test]
    fn version_mismatch_is_refused() {
        let kp_r = Arc::new(Keypair::generate());
        let (mut responder, _) = Handshake::start(Role::Responder, kp_r, vec![]);

        let step = responder.on_message(Message::HandshakeRequest(HandshakeRequest {
            nonce_a: vec![1; 16],
            protocol_version: "2.0.0".into(),
            capabilities: vec![],
        }));
        match step {
            Step::Fail { notify, .. } => match notify {
                Some(Message::HandshakeFailure(f)) => {
                    assert_eq!(f.code, ErrorCode::VersionMismatch.code());
                }
                other => panic!("expected HandshakeFailure, got {other:?}"),
            },
            _ => panic!("expected Fail"),
        }
        assert_eq!(responder.phase(), PeerState::Failed);
    }

    #[test]
    fn unexpected_message_fails_handshake() {
        let kp_r = Arc::new(Keypair::generate());
        let (mut responder, _) = Handshake::start(Role::Responder, kp_r, vec![]);

        let step = responder.on_message(Message::Heartbeat);
        assert!(matches!(step, Step::Fail { notify: Some(_), .. }));
        assert_eq!(responder.phase(), PeerState::Failed);
    }

    #[test]
    fn peer_failure_message_aborts_quietly() {
        let kp_i = Arc::new(Keypair::generate());
        let (mut initiator, _) = Handshake::start(Role::Initiator, kp_i, vec![]);
        let step = initiator.on_message(Message::HandshakeFailure(HandshakeFailure {
            code: ErrorCode::VersionMismatch.code(),
            reason: "no".into(),
        }));
        // we do not answer a failure with another failure
        assert!(matches!(step, Step::Fail { notify: None, .. }));
    }

    #[test]
    fn tampered_confirmation_tag_rejected() {
        let kp_i = Arc::new(Keypair::generate());
        let kp_r = Arc::new(Keypair::generate());
        let (mut initiator, first) = Handshake::start(Role::Initiator, kp_i, vec![]);
        let (mut responder, _) = Handshake::start(Role::Responder, kp_r, vec![]);

        let Step::Send(resp_out) = responder.on_message(first.unwrap()) else {
            panic!()
        };
        let Step::Send(init_out) = initiator.on_message(resp_out.into_iter().next().unwrap())
        else {
            panic!()
        };
        let mut init_msgs = init_out.into_iter();
        responder.on_message(init_msgs.next().unwrap()); // Ack
        let Step::Send(key_resp) = responder.on_message(init_msgs.next().unwrap()) else {
            panic!()
        };
        let Step::SendAndFinish(complete, _secrets) =
            initiator.on_message(key_resp.into_iter().next().unwrap())
        else {
            panic!()
        };

        // flip a byte in the confirmation tag
        let Message::KeyExchangeComplete(mut body) = complete.into_iter().next().unwrap() else {
            panic!()
        };
        body.ephemeral_params[0] ^= 0xff;
        let step = responder.on_message(Message::KeyExchangeComplete(body));
        assert!(matches!(step, Step::Fail { .. }));
    }

    #[test]
    fn rederive_after_rotation_matches_on_both_sides() {
        let (i, r) = run_to_completion();

        let eph_a = EphemeralKey::generate();
        let eph_b = EphemeralKey::generate();
        let pub_a = eph_a.public;
        let pub_b = eph_b.public;

        let dh_a = eph_a.agree(&pub_b).unwrap();
        let dh_b = eph_b.agree(&pub_a).unwrap();

        let mut new_i = i.rederive(&dh_a).unwrap();
        let new_r = r.rederive(&dh_b).unwrap();

        let sealed = new_i.seal(b"post-rotation").unwrap();
        assert_eq!(new_r.open(&sealed).unwrap(), b"post-rotation");
    }
}
