//! Typed protocol messages — every payload that travels inside an envelope.
//!
//! The original design dispatched on reflection-registered processors; here
//! the whole message space is one tagged enum with exhaustive matching. The
//! envelope's `messageType` header carries the variant name, and the payload
//! is the variant body serialized as canonical JSON with camelCase fields.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::envelope::{ticks_now, Envelope, TICKS_PER_SECOND};
use crate::error::{in_band, WireError};
use crate::id::{FileId, NodeId};
use crate::manifest::FileManifest;

/// Envelope timestamps further than this from local wall clock are rejected.
pub const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Broadcast TTL bounds, inclusive.
pub const TTL_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// Discovery max-age upper bound: ten minutes.
pub const MAX_DISCOVERY_AGE_MS: u64 = 10 * 60 * 1000;

const MAX_METADATA_ENTRIES: usize = 20;
const MAX_METADATA_KEY: usize = 50;
const MAX_METADATA_VALUE: usize = 200;

// ── base64 serde helper ───────────────────────────────────────────────────────

/// `#[serde(with = "b64")]` for binary fields carried inside JSON payloads.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ── Discovery payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    /// "host:port" the announcing node accepts sessions on.
    pub endpoint: String,
    pub metadata: BTreeMap<String, String>,
    pub announcement_id: String,
    pub time_to_live: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDiscovery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_capability: Option<String>,
    pub max_age_ms: u64,
    pub discovery_id: String,
    pub time_to_live: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: NodeId,
    pub endpoint: String,
    pub protocol_version: String,
    /// Ticks since 0001-01-01 UTC.
    pub last_seen: i64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDiscoveryResponse {
    pub peers: Vec<PeerSummary>,
    pub response_id: String,
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeave {
    pub reason: String,
    pub grace_period_seconds: u32,
    pub leave_id: String,
    pub time_to_live: u8,
}

// ── Handshake and keying payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(with = "b64")]
    pub nonce_a: Vec<u8>,
    pub protocol_version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(with = "b64")]
    pub nonce_b: Vec<u8>,
    pub protocol_version_accepted: String,
    /// Responder's static public parameters.
    #[serde(with = "b64")]
    pub public_params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    /// Initiator's static public parameters.
    #[serde(with = "b64")]
    pub public_params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFailure {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchange {
    /// Ephemeral public parameters for Init/Response; the key-confirmation
    /// tag for Complete.
    #[serde(with = "b64")]
    pub ephemeral_params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotation {
    #[serde(with = "b64")]
    pub new_params: Vec<u8>,
}

// ── Transfer payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub file_id: FileId,
    pub manifest: FileManifest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub file_id: FileId,
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: FileId,
    pub sequence: u64,
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
    #[serde(with = "b64")]
    pub chunk_checksum: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub file_id: FileId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResendRequest {
    pub file_id: FileId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub file_id: FileId,
    pub bytes_acked: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComplete {
    pub file_id: FileId,
    #[serde(with = "b64")]
    pub file_checksum: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCancel {
    pub file_id: FileId,
    pub reason: String,
}

// ── Control payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub ack_of: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumRequest {
    pub file_id: FileId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumResponse {
    pub file_id: FileId,
    #[serde(with = "b64")]
    pub checksum: Vec<u8>,
    pub checksum_algorithm: ChecksumAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkChecksum {
    pub file_id: FileId,
    pub sequence: u64,
    #[serde(with = "b64")]
    pub checksum: Vec<u8>,
}

// ── The message enum ──────────────────────────────────────────────────────────

/// Which family a message belongs to. Routing and encryption policy key
/// off the family, not the individual type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFamily {
    Discovery,
    Handshake,
    Transfer,
    Control,
}

/// Every message Portage speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // discovery
    PeerAnnouncement(PeerAnnouncement),
    PeerDiscovery(PeerDiscovery),
    PeerDiscoveryResponse(PeerDiscoveryResponse),
    PeerLeave(PeerLeave),

    // handshake / keying
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    HandshakeAck(HandshakeAck),
    HandshakeFailure(HandshakeFailure),
    KeyExchangeInit(KeyExchange),
    KeyExchangeResponse(KeyExchange),
    KeyExchangeComplete(KeyExchange),
    KeyRotation(KeyRotation),

    // transfer
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    FileMetadata(FileManifest),
    FileChunk(FileChunk),
    ChunkAck(ChunkAck),
    ChunkResendRequest(ChunkResendRequest),
    TransferProgress(TransferProgress),
    TransferComplete(TransferComplete),
    TransferCancel(TransferCancel),

    // control
    Heartbeat,
    Ack(Ack),
    Error(WireError),
    Disconnect(Disconnect),
    ChecksumRequest(ChecksumRequest),
    ChecksumResponse(ChecksumResponse),
    ChunkChecksum(ChunkChecksum),
}

impl Message {
    /// The `messageType` header string for this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::PeerAnnouncement(_) => "PeerAnnouncement",
            Message::PeerDiscovery(_) => "PeerDiscovery",
            Message::PeerDiscoveryResponse(_) => "PeerDiscoveryResponse",
            Message::PeerLeave(_) => "PeerLeave",
            Message::HandshakeRequest(_) => "HandshakeRequest",
            Message::HandshakeResponse(_) => "HandshakeResponse",
            Message::HandshakeAck(_) => "HandshakeAck",
            Message::HandshakeFailure(_) => "HandshakeFailure",
            Message::KeyExchangeInit(_) => "KeyExchangeInit",
            Message::KeyExchangeResponse(_) => "KeyExchangeResponse",
            Message::KeyExchangeComplete(_) => "KeyExchangeComplete",
            Message::KeyRotation(_) => "KeyRotation",
            Message::TransferRequest(_) => "TransferRequest",
            Message::TransferResponse(_) => "TransferResponse",
            Message::FileMetadata(_) => "FileMetadata",
            Message::FileChunk(_) => "FileChunk",
            Message::ChunkAck(_) => "ChunkAck",
            Message::ChunkResendRequest(_) => "ChunkResendRequest",
            Message::TransferProgress(_) => "TransferProgress",
            Message::TransferComplete(_) => "TransferComplete",
            Message::TransferCancel(_) => "TransferCancel",
            Message::Heartbeat => "Heartbeat",
            Message::Ack(_) => "Ack",
            Message::Error(_) => "Error",
            Message::Disconnect(_) => "Disconnect",
            Message::ChecksumRequest(_) => "ChecksumRequest",
            Message::ChecksumResponse(_) => "ChecksumResponse",
            Message::ChunkChecksum(_) => "ChunkChecksum",
        }
    }

    pub fn family(&self) -> MessageFamily {
        match self {
            Message::PeerAnnouncement(_)
            | Message::PeerDiscovery(_)
            | Message::PeerDiscoveryResponse(_)
            | Message::PeerLeave(_) => MessageFamily::Discovery,

            Message::HandshakeRequest(_)
            | Message::HandshakeResponse(_)
            | Message::HandshakeAck(_)
            | Message::HandshakeFailure(_)
            | Message::KeyExchangeInit(_)
            | Message::KeyExchangeResponse(_)
            | Message::KeyExchangeComplete(_)
            | Message::KeyRotation(_) => MessageFamily::Handshake,

            Message::TransferRequest(_)
            | Message::TransferResponse(_)
            | Message::FileMetadata(_)
            | Message::FileChunk(_)
            | Message::ChunkAck(_)
            | Message::ChunkResendRequest(_)
            | Message::TransferProgress(_)
            | Message::TransferComplete(_)
            | Message::TransferCancel(_) => MessageFamily::Transfer,

            Message::Heartbeat
            | Message::Ack(_)
            | Message::Error(_)
            | Message::Disconnect(_)
            | Message::ChecksumRequest(_)
            | Message::ChecksumResponse(_)
            | Message::ChunkChecksum(_) => MessageFamily::Control,
        }
    }

    /// Must this payload travel sealed under the session key?
    ///
    /// Discovery runs before any session exists and the handshake family
    /// establishes the key, so both stay in the clear. Heartbeats carry
    /// nothing worth sealing. KeyRotation happens inside an authenticated
    /// session and is sealed under the outgoing key.
    pub fn requires_encryption(&self) -> bool {
        match self {
            Message::Heartbeat => false,
            Message::KeyRotation(_) => true,
            _ => matches!(
                self.family(),
                MessageFamily::Transfer | MessageFamily::Control
            ),
        }
    }

    /// Serialize the payload body to canonical JSON bytes.
    pub fn to_payload(&self) -> Result<Bytes, MessageError> {
        let vec = match self {
            Message::PeerAnnouncement(b) => serde_json::to_vec(b)?,
            Message::PeerDiscovery(b) => serde_json::to_vec(b)?,
            Message::PeerDiscoveryResponse(b) => serde_json::to_vec(b)?,
            Message::PeerLeave(b) => serde_json::to_vec(b)?,
            Message::HandshakeRequest(b) => serde_json::to_vec(b)?,
            Message::HandshakeResponse(b) => serde_json::to_vec(b)?,
            Message::HandshakeAck(b) => serde_json::to_vec(b)?,
            Message::HandshakeFailure(b) => serde_json::to_vec(b)?,
            Message::KeyExchangeInit(b)
            | Message::KeyExchangeResponse(b)
            | Message::KeyExchangeComplete(b) => serde_json::to_vec(b)?,
            Message::KeyRotation(b) => serde_json::to_vec(b)?,
            Message::TransferRequest(b) => serde_json::to_vec(b)?,
            Message::TransferResponse(b) => serde_json::to_vec(b)?,
            Message::FileMetadata(b) => serde_json::to_vec(b)?,
            Message::FileChunk(b) => serde_json::to_vec(b)?,
            Message::ChunkAck(b) => serde_json::to_vec(b)?,
            Message::ChunkResendRequest(b) => serde_json::to_vec(b)?,
            Message::TransferProgress(b) => serde_json::to_vec(b)?,
            Message::TransferComplete(b) => serde_json::to_vec(b)?,
            Message::TransferCancel(b) => serde_json::to_vec(b)?,
            Message::Heartbeat => b"{}".to_vec(),
            Message::Ack(b) => serde_json::to_vec(b)?,
            Message::Error(b) => serde_json::to_vec(b)?,
            Message::Disconnect(b) => serde_json::to_vec(b)?,
            Message::ChecksumRequest(b) => serde_json::to_vec(b)?,
            Message::ChecksumResponse(b) => serde_json::to_vec(b)?,
            Message::ChunkChecksum(b) => serde_json::to_vec(b)?,
        };
        Ok(Bytes::from(vec))
    }

    /// Deserialize a payload given the `messageType` header string.
    pub fn from_payload(message_type: &str, payload: &[u8]) -> Result<Message, MessageError> {
        let msg = match message_type {
            "PeerAnnouncement" => Message::PeerAnnouncement(serde_json::from_slice(payload)?),
            "PeerDiscovery" => Message::PeerDiscovery(serde_json::from_slice(payload)?),
            "PeerDiscoveryResponse" => {
                Message::PeerDiscoveryResponse(serde_json::from_slice(payload)?)
            }
            "PeerLeave" => Message::PeerLeave(serde_json::from_slice(payload)?),
            "HandshakeRequest" => Message::HandshakeRequest(serde_json::from_slice(payload)?),
            "HandshakeResponse" => Message::HandshakeResponse(serde_json::from_slice(payload)?),
            "HandshakeAck" => Message::HandshakeAck(serde_json::from_slice(payload)?),
            "HandshakeFailure" => Message::HandshakeFailure(serde_json::from_slice(payload)?),
            "KeyExchangeInit" => Message::KeyExchangeInit(serde_json::from_slice(payload)?),
            "KeyExchangeResponse" => Message::KeyExchangeResponse(serde_json::from_slice(payload)?),
            "KeyExchangeComplete" => Message::KeyExchangeComplete(serde_json::from_slice(payload)?),
            "KeyRotation" => Message::KeyRotation(serde_json::from_slice(payload)?),
            "TransferRequest" => Message::TransferRequest(serde_json::from_slice(payload)?),
            "TransferResponse" => Message::TransferResponse(serde_json::from_slice(payload)?),
            "FileMetadata" => Message::FileMetadata(serde_json::from_slice(payload)?),
            "FileChunk" => Message::FileChunk(serde_json::from_slice(payload)?),
            "ChunkAck" => Message::ChunkAck(serde_json::from_slice(payload)?),
            "ChunkResendRequest" => Message::ChunkResendRequest(serde_json::from_slice(payload)?),
            "TransferProgress" => Message::TransferProgress(serde_json::from_slice(payload)?),
            "TransferComplete" => Message::TransferComplete(serde_json::from_slice(payload)?),
            "TransferCancel" => Message::TransferCancel(serde_json::from_slice(payload)?),
            "Heartbeat" => Message::Heartbeat,
            "Ack" => Message::Ack(serde_json::from_slice(payload)?),
            "Error" => Message::Error(serde_json::from_slice(payload)?),
            "Disconnect" => Message::Disconnect(serde_json::from_slice(payload)?),
            "ChecksumRequest" => Message::ChecksumRequest(serde_json::from_slice(payload)?),
            "ChecksumResponse" => Message::ChecksumResponse(serde_json::from_slice(payload)?),
            "ChunkChecksum" => Message::ChunkChecksum(serde_json::from_slice(payload)?),
            other => return Err(MessageError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }

    /// Wrap this message in an envelope addressed `source → dest`.
    /// An empty `dest` broadcasts; an empty `correlation` means none.
    pub fn into_envelope(
        self,
        source: &NodeId,
        dest: Option<&NodeId>,
        correlation: &str,
    ) -> Result<Envelope, MessageError> {
        self.validate()?;
        let payload = self.to_payload()?;
        Ok(Envelope::new(
            self.message_type(),
            source.to_hex(),
            dest.map(NodeId::to_hex).unwrap_or_default(),
            correlation.to_string(),
            payload,
        ))
    }

    /// Decode the typed message out of an envelope and validate its content.
    pub fn from_envelope(envelope: &Envelope) -> Result<Message, MessageError> {
        let msg = Message::from_payload(&envelope.message_type, &envelope.payload)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Content validation per family rules. Framing is the codec's job;
    /// everything here is about field values.
    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            Message::PeerAnnouncement(a) => {
                validate_ttl(a.time_to_live)?;
                validate_metadata(&a.metadata)?;
                if a.endpoint.is_empty() {
                    return Err(MessageError::Invalid("announcement endpoint is empty"));
                }
            }
            Message::PeerDiscovery(d) => {
                validate_ttl(d.time_to_live)?;
                if d.max_age_ms == 0 || d.max_age_ms > MAX_DISCOVERY_AGE_MS {
                    return Err(MessageError::Invalid("maxAgeMs outside (0, 10min]"));
                }
            }
            Message::PeerDiscoveryResponse(r) => {
                for peer in &r.peers {
                    validate_metadata(&peer.metadata)?;
                }
                if !r.is_success {
                    match r.error_code {
                        Some(code) if in_band(code) => {}
                        _ => {
                            return Err(MessageError::Invalid(
                                "failed discovery response needs an in-band error code",
                            ))
                        }
                    }
                }
            }
            Message::PeerLeave(l) => validate_ttl(l.time_to_live)?,
            Message::HandshakeRequest(h) => {
                if h.nonce_a.is_empty() {
                    return Err(MessageError::Invalid("handshake nonce is empty"));
                }
                if h.protocol_version.is_empty() {
                    return Err(MessageError::Invalid("protocol version is empty"));
                }
            }
            Message::HandshakeResponse(h) => {
                if h.nonce_b.is_empty() || h.public_params.is_empty() {
                    return Err(MessageError::Invalid("handshake response is incomplete"));
                }
            }
            Message::HandshakeAck(h) => {
                if h.public_params.is_empty() {
                    return Err(MessageError::Invalid("handshake ack has no public params"));
                }
            }
            Message::HandshakeFailure(f) => {
                if !in_band(f.code) {
                    return Err(MessageError::Invalid("handshake failure code out of band"));
                }
            }
            Message::KeyExchangeInit(k)
            | Message::KeyExchangeResponse(k)
            | Message::KeyExchangeComplete(k) => {
                if k.ephemeral_params.is_empty() {
                    return Err(MessageError::Invalid("key exchange params are empty"));
                }
            }
            Message::KeyRotation(k) => {
                if k.new_params.is_empty() {
                    return Err(MessageError::Invalid("key rotation params are empty"));
                }
            }
            Message::TransferRequest(t) => {
                t.manifest
                    .validate()
                    .map_err(|e| MessageError::InvalidDetail(e.to_string()))?;
                if t.file_id != t.manifest.file_id {
                    return Err(MessageError::Invalid("request fileId disagrees with manifest"));
                }
            }
            Message::FileMetadata(m) => m
                .validate()
                .map_err(|e| MessageError::InvalidDetail(e.to_string()))?,
            Message::FileChunk(c) => {
                if c.bytes.is_empty() {
                    return Err(MessageError::Invalid("chunk carries no bytes"));
                }
                if c.chunk_checksum.is_empty() {
                    return Err(MessageError::Invalid("chunk carries no checksum"));
                }
            }
            Message::Error(e) => {
                if !in_band(e.code) {
                    return Err(MessageError::Invalid("error code out of band"));
                }
            }
            Message::TransferResponse(_)
            | Message::ChunkAck(_)
            | Message::ChunkResendRequest(_)
            | Message::TransferProgress(_)
            | Message::TransferComplete(_)
            | Message::TransferCancel(_)
            | Message::Heartbeat
            | Message::Ack(_)
            | Message::Disconnect(_)
            | Message::ChecksumRequest(_)
            | Message::ChecksumResponse(_)
            | Message::ChunkChecksum(_) => {}
        }
        Ok(())
    }
}

/// Encryption policy keyed by the `messageType` header alone, for receivers
/// that must decide whether to open a sealed payload before they can parse
/// it. Must agree with [`Message::requires_encryption`].
pub fn type_requires_encryption(message_type: &str) -> bool {
    !matches!(
        message_type,
        "PeerAnnouncement"
            | "PeerDiscovery"
            | "PeerDiscoveryResponse"
            | "PeerLeave"
            | "HandshakeRequest"
            | "HandshakeResponse"
            | "HandshakeAck"
            | "HandshakeFailure"
            | "KeyExchangeInit"
            | "KeyExchangeResponse"
            | "KeyExchangeComplete"
            | "Heartbeat"
    )
}

fn validate_ttl(ttl: u8) -> Result<(), MessageError> {
    if TTL_RANGE.contains(&ttl) {
        Ok(())
    } else {
        Err(MessageError::Invalid("broadcast TTL outside [1, 10]"))
    }
}

fn validate_metadata(map: &BTreeMap<String, String>) -> Result<(), MessageError> {
    if map.len() > MAX_METADATA_ENTRIES {
        return Err(MessageError::Invalid("metadata map has too many entries"));
    }
    for (k, v) in map {
        if k.len() > MAX_METADATA_KEY || v.len() > MAX_METADATA_VALUE {
            return Err(MessageError::Invalid("metadata entry too long"));
        }
    }
    Ok(())
}

/// Check an envelope timestamp against local wall clock, ±5 minutes.
pub fn validate_timestamp(timestamp_ticks: i64) -> Result<(), MessageError> {
    let skew = (timestamp_ticks - ticks_now()).abs();
    if skew > MAX_CLOCK_SKEW_SECS * TICKS_PER_SECOND {
        return Err(MessageError::ClockSkew);
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid message: {0}")]
    Invalid(&'static str),

    #[error("invalid message: {0}")]
    InvalidDetail(String),

    #[error("envelope timestamp outside clock-skew window")]
    ClockSkew,

    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
