//! Checksum algorithms for chunk and file integrity.
//!
//! Four algorithms are spoken on the wire, identified by a one-byte code
//! carried in the manifest. Chunk checksums and the whole-file checksum of
//! a transfer always use the same algorithm.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

/// Shake256 is an extendable-output function; Portage fixes its output
/// at 32 bytes.
const SHAKE_OUTPUT_LEN: usize = 32;

// ── Algorithm ─────────────────────────────────────────────────────────────────

/// Wire codes: 1=Sha256, 2=Sha512, 3=Shake256, 4=Blake3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChecksumAlgorithm {
    Sha256 = 1,
    Sha512 = 2,
    Shake256 = 3,
    Blake3 = 4,
}

impl ChecksumAlgorithm {
    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 32,
            ChecksumAlgorithm::Sha512 => 64,
            ChecksumAlgorithm::Shake256 => SHAKE_OUTPUT_LEN,
            ChecksumAlgorithm::Blake3 => 32,
        }
    }
}

impl TryFrom<u8> for ChecksumAlgorithm {
    type Error = ChecksumError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChecksumAlgorithm::Sha256),
            2 => Ok(ChecksumAlgorithm::Sha512),
            3 => Ok(ChecksumAlgorithm::Shake256),
            4 => Ok(ChecksumAlgorithm::Blake3),
            other => Err(ChecksumError::UnknownAlgorithm(other)),
        }
    }
}

impl From<ChecksumAlgorithm> for u8 {
    fn from(a: ChecksumAlgorithm) -> u8 {
        a as u8
    }
}

impl Serialize for ChecksumAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ChecksumAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        ChecksumAlgorithm::try_from(v).map_err(serde::de::Error::custom)
    }
}

// ── One-shot digest ───────────────────────────────────────────────────────────

/// Digest a byte slice under the given algorithm.
pub fn digest(algorithm: ChecksumAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut d = Digester::new(algorithm);
    d.update(data);
    d.finalize()
}

// ── Streaming digest ──────────────────────────────────────────────────────────

/// Incremental digester for payloads that arrive in pieces — chunk writes
/// and whole-file verification during assembly.
pub struct Digester(Inner);

enum Inner {
    Sha256(Sha256),
    Sha512(Sha512),
    Shake256(Shake256),
    Blake3(blake3::Hasher),
}

impl Digester {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self(match algorithm {
            ChecksumAlgorithm::Sha256 => Inner::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Inner::Sha512(Sha512::new()),
            ChecksumAlgorithm::Shake256 => Inner::Shake256(Shake256::default()),
            ChecksumAlgorithm::Blake3 => Inner::Blake3(blake3::Hasher::new()),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            Inner::Sha256(h) => sha2::Digest::update(h, data),
            Inner::Sha512(h) => sha2::Digest::update(h, data),
            Inner::Shake256(h) => h.update(data),
            Inner::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.0 {
            Inner::Sha256(h) => h.finalize().to_vec(),
            Inner::Sha512(h) => h.finalize().to_vec(),
            Inner::Shake256(h) => {
                let mut out = vec![0u8; SHAKE_OUTPUT_LEN];
                h.finalize_xof().read(&mut out);
                out
            }
            Inner::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    #[error("unknown checksum algorithm code: {0}")]
    UnknownAlgorithm(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for code in 1u8..=4 {
            let algo = ChecksumAlgorithm::try_from(code).unwrap();
            assert_eq!(u8::from(algo), code);
        }
        assert!(ChecksumAlgorithm::try_from(0).is_err());
        assert!(ChecksumAlgorithm::try_from(5).is_err());
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(digest(ChecksumAlgorithm::Sha256, b"x").len(), 32);
        assert_eq!(digest(ChecksumAlgorithm::Sha512, b"x").len(), 64);
        assert_eq!(digest(ChecksumAlgorithm::Shake256, b"x").len(), 32);
        assert_eq!(digest(ChecksumAlgorithm::Blake3, b"x").len(), 32);
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(digest(ChecksumAlgorithm::Sha256, b""), expected);
    }

    #[test]
    fn blake3_matches_reference() {
        let data = b"portage checksum test";
        assert_eq!(
            digest(ChecksumAlgorithm::Blake3, data),
            blake3::hash(data).as_bytes().to_vec()
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        for algo in [
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha512,
            ChecksumAlgorithm::Shake256,
            ChecksumAlgorithm::Blake3,
        ] {
            let mut d = Digester::new(algo);
            d.update(b"hello ");
            d.update(b"world");
            assert_eq!(d.finalize(), digest(algo, b"hello world"), "{algo:?}");
        }
    }

    #[test]
    fn algorithms_disagree() {
        let data = b"same input";
        assert_ne!(
            digest(ChecksumAlgorithm::Sha256, data),
            digest(ChecksumAlgorithm::Blake3, data)
        );
    }

    #[test]
    fn serde_as_wire_code() {
        let json = serde_json::to_string(&ChecksumAlgorithm::Blake3).unwrap();
        assert_eq!(json, "4");
        let back: ChecksumAlgorithm = serde_json::from_str("1").unwrap();
        assert_eq!(back, ChecksumAlgorithm::Sha256);
    }
}
