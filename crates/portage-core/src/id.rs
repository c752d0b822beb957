//! Identifier value types — node, file, and chunk identities plus peer
//! addresses. All compare by bytes and render as lowercase hex.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── NodeId ────────────────────────────────────────────────────────────────────

/// 128-bit opaque node identifier, generated once per node.
///
/// Appears in every envelope's source field and (unless broadcasting) the
/// destination field, rendered as 32 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// Generate a fresh random node identity.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::BadHex)?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| IdError::BadLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── FileId ────────────────────────────────────────────────────────────────────

/// Stable identifier for a transferable file.
///
/// Derived as the BLAKE3 hash of the file's manifest block, so the same
/// content with the same chunking always yields the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub [u8; 32]);

impl FileId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a file id by hashing an arbitrary byte string (typically the
    /// serialized manifest).
    pub fn derive(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::BadHex)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| IdError::BadLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", &self.to_hex()[..8])
    }
}

impl FromStr for FileId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for FileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── ChunkId ───────────────────────────────────────────────────────────────────

/// Identity of one chunk: the file it belongs to, its position within the
/// file, and its own checksum under the transfer's algorithm.
///
/// The checksum length depends on the algorithm (64 bytes for Sha512,
/// 32 otherwise), so it is held as a plain byte vector.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub file: FileId,
    pub sequence: u64,
    pub content_hash: Vec<u8>,
}

impl ChunkId {
    pub fn new(file: FileId, sequence: u64, content_hash: Vec<u8>) -> Self {
        Self {
            file,
            sequence,
            content_hash,
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.content_hash)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChunkId({}/{} {})",
            &self.file.to_hex()[..8],
            self.sequence,
            &self.hash_hex()[..8.min(self.hash_hex().len())]
        )
    }
}

// ── PeerAddress ───────────────────────────────────────────────────────────────

/// A peer's reachable endpoint, host plus TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a "host:port" string. IPv6 literals use the bracketed form
    /// "[::1]:9000".
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let (host, port) = s.rsplit_once(':').ok_or(IdError::BadAddress)?;
        let port: u16 = port.parse().map_err(|_| IdError::BadAddress)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(IdError::BadAddress);
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PeerAddress> for String {
    fn from(a: PeerAddress) -> String {
        a.to_string()
    }
}

// ── Message ids ───────────────────────────────────────────────────────────────

/// Generate a fresh envelope message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("not valid hex")]
    BadHex,

    #[error("wrong identifier length")]
    BadLength,

    #[error("address must be host:port")]
    BadAddress,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
