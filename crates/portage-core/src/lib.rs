//! portage-core — identifiers, wire format, typed messages, and cryptographic
//! primitives. All other Portage crates depend on this one.

pub mod checksum;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod id;
pub mod manifest;
pub mod message;

pub use envelope::{Envelope, EnvelopeHead, PayloadFormat};
pub use id::{ChunkId, FileId, NodeId, PeerAddress};
pub use manifest::FileManifest;
pub use message::Message;

/// Protocol revision spoken by this implementation.
///
/// The handshake accepts exactly this version; anything else is answered
/// with a VersionMismatch failure.
pub const PROTOCOL_VERSION: &str = "1.0.0";
