//! Cryptographic primitives for Portage sessions.
//!
//! Provides three things:
//!   1. Long-term x25519 identity keypairs — the "public params" exchanged
//!      during the handshake
//!   2. Ephemeral x25519 key agreement + HKDF-SHA256 session-key derivation,
//!      bound to both handshake nonces
//!   3. AES-256-GCM sealing of message payloads under the derived key
//!
//! Fresh ephemerals are drawn for every session and every key rotation, so
//! compromise of a static key never exposes past traffic.
//!
//! Key material is zeroized on drop. There is no unsafe code in this module.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Handshake nonces are 16 bytes.
pub const NONCE_LEN: usize = 16;

/// x25519 public keys are 32 bytes.
pub const PUBLIC_PARAMS_LEN: usize = 32;

/// Sealed payloads are prefixed with an 8-byte little-endian counter and
/// suffixed with the 16-byte GCM tag.
const SEAL_OVERHEAD: usize = 8 + 16;

// ── Identity keypair ──────────────────────────────────────────────────────────

/// A node's long-term static x25519 keypair.
///
/// Generated once per node and stored persistently. The public half is the
/// `publicParams` field of HandshakeResponse/HandshakeAck; the private half
/// never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            public: *public.as_bytes(),
            secret,
        }
    }

    /// Reconstruct from stored private key bytes. The public key is derived
    /// deterministically.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            public: *public.as_bytes(),
            secret,
        }
    }

    /// Serialize the private key for persistent storage (mode 0600).
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }
}

// ── Nonces ────────────────────────────────────────────────────────────────────

/// Generate a cryptographically random handshake nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

// ── Ephemeral agreement ───────────────────────────────────────────────────────

/// One side's ephemeral contribution to a key exchange.
///
/// Consumed by [`EphemeralKey::agree`] — the secret cannot outlive the
/// single agreement it participates in.
pub struct EphemeralKey {
    secret: EphemeralSecret,
    pub public: [u8; 32],
}

impl EphemeralKey {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            public: *public.as_bytes(),
            secret,
        }
    }

    /// Run the Diffie-Hellman agreement against the peer's ephemeral public
    /// params.
    pub fn agree(self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::BadPublicParams)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

// ── Session key ───────────────────────────────────────────────────────────────

/// Derive a session key from a completed agreement.
///
///   key = HKDF-SHA256(ikm = dh, salt = nonceA ‖ nonceB, info = info)
///
/// Both nonces go into the salt so neither side controls the key unilaterally;
/// `info` binds the static public params of both parties.
pub fn derive_session_key(
    dh: &[u8; 32],
    nonce_a: &[u8],
    nonce_b: &[u8],
    info: &[u8],
) -> Result<SessionKey, CryptoError> {
    let mut salt = Vec::with_capacity(nonce_a.len() + nonce_b.len());
    salt.extend_from_slice(nonce_a);
    salt.extend_from_slice(nonce_b);

    let hk = Hkdf::<Sha256>::new(Some(&salt), dh);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, okm.as_mut())
        .map_err(|_| CryptoError::Derivation)?;

    SessionKey::from_bytes(&okm)
}

/// A derived symmetric session key, ready to seal and open payloads.
///
/// Wire format per sealed payload:
///   [u64 counter LE (8 bytes)] [AES-256-GCM ciphertext (payload + 16-byte tag)]
///
/// The 96-bit GCM nonce is the counter padded with zeroes; the counter is
/// strictly increasing per direction, and the underlying transport (TCP)
/// preserves order, so nonces never repeat under one key. Key rotation
/// resets the counter together with the key.
pub struct SessionKey {
    key: Zeroizing<[u8; 32]>,
    cipher: Aes256Gcm,
    send_counter: u64,
}

impl SessionKey {
    pub fn from_bytes(key: &[u8; 32]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Derivation)?;
        Ok(Self {
            key: Zeroizing::new(*key),
            cipher,
            send_counter: 0,
        })
    }

    /// Seal a payload. Output is `8 + plaintext.len() + 16` bytes.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.send_counter;
        self.send_counter += 1;

        let nonce = nonce_from_counter(counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload. Fails on truncation or tag mismatch.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort);
        }
        let counter = u64::from_le_bytes(sealed[..8].try_into().unwrap());
        let nonce = nonce_from_counter(counter);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), &sealed[8..])
            .map_err(|_| CryptoError::Open)
    }

    /// Key-confirmation tag over both handshake nonces.
    ///
    /// Sent in KeyExchangeComplete; if the two sides derived different keys
    /// the tag check fails before any payload is sealed.
    pub fn confirmation_tag(&self, nonce_a: &[u8], nonce_b: &[u8]) -> Vec<u8> {
        let mut input = Vec::with_capacity(nonce_a.len() + nonce_b.len());
        input.extend_from_slice(nonce_a);
        input.extend_from_slice(nonce_b);
        blake3::keyed_hash(&self.key, &input).as_bytes().to_vec()
    }

    pub fn verify_confirmation(&self, tag: &[u8], nonce_a: &[u8], nonce_b: &[u8]) -> bool {
        // blake3 keyed-hash comparison is constant-time via Hash's PartialEq
        let expected = blake3::keyed_hash(&self.key, &{
            let mut input = Vec::with_capacity(nonce_a.len() + nonce_b.len());
            input.extend_from_slice(nonce_a);
            input.extend_from_slice(nonce_b);
            input
        });
        match <[u8; 32]>::try_from(tag) {
            Ok(tag) => expected == blake3::Hash::from(tag),
            Err(_) => false,
        }
    }
}

fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("public params are not a valid x25519 key")]
    BadPublicParams,

    #[error("session key derivation failed")]
    Derivation,

    #[error("payload sealing failed")]
    Seal,

    #[error("sealed payload failed authentication")]
    Open,

    #[error("sealed payload too short (need at least 24 bytes)")]
    TooShort,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a full exchange and return both sides' session keys.
    fn paired_keys() -> (SessionKey, SessionKey) {
        let nonce_a = generate_nonce();
        let nonce_b = generate_nonce();

        let eph_i = EphemeralKey::generate();
        let eph_r = EphemeralKey::generate();
        let pub_i = eph_i.public;
        let pub_r = eph_r.public;

        let dh_i = eph_i.agree(&pub_r).unwrap();
        let dh_r = eph_r.agree(&pub_i).unwrap();
        assert_eq!(*dh_i, *dh_r);

        let info = b"static-params";
        let k_i = derive_session_key(&dh_i, &nonce_a, &nonce_b, info).unwrap();
        let k_r = derive_session_key(&dh_r, &nonce_a, &nonce_b, info).unwrap();
        (k_i, k_r)
    }

    #[test]
    fn keypair_round_trips_private_bytes() {
        let kp = Keypair::generate();
        let restored = Keypair::from_private(*kp.private_bytes());
        assert_eq!(kp.public, restored.public);
    }

    #[test]
    fn two_keypairs_differ() {
        assert_ne!(Keypair::generate().public, Keypair::generate().public);
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut a, b) = paired_keys();
        let sealed = a.seal(b"chunk payload").unwrap();
        assert_eq!(sealed.len(), 8 + 13 + 16);
        assert_ne!(&sealed[8..], b"chunk payload".as_slice());
        assert_eq!(b.open(&sealed).unwrap(), b"chunk payload");
    }

    #[test]
    fn counters_advance_per_seal() {
        let (mut a, b) = paired_keys();
        let s0 = a.seal(b"one").unwrap();
        let s1 = a.seal(b"two").unwrap();
        assert_eq!(u64::from_le_bytes(s0[..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(s1[..8].try_into().unwrap()), 1);
        assert_eq!(b.open(&s0).unwrap(), b"one");
        assert_eq!(b.open(&s1).unwrap(), b"two");
    }

    #[test]
    fn tampered_payload_rejected() {
        let (mut a, b) = paired_keys();
        let mut sealed = a.seal(b"important").unwrap();
        sealed[10] ^= 0xff;
        assert_eq!(b.open(&sealed), Err(CryptoError::Open));
    }

    #[test]
    fn too_short_rejected() {
        let (_, b) = paired_keys();
        assert_eq!(b.open(&[0u8; 20]), Err(CryptoError::TooShort));
    }

    #[test]
    fn different_nonces_derive_different_keys() {
        let eph_i = EphemeralKey::generate();
        let eph_r = EphemeralKey::generate();
        let pub_r = eph_r.public;
        let dh = eph_i.agree(&pub_r).unwrap();

        let n1 = generate_nonce();
        let n2 = generate_nonce();
        let mut k1 = derive_session_key(&dh, &n1, &n2, b"i").unwrap();
        let k2 = derive_session_key(&dh, &n2, &n1, b"i").unwrap();

        // Swapped nonces must not decrypt each other's traffic
        let sealed = k1.seal(b"x").unwrap();
        assert!(k2.open(&sealed).is_err());
    }

    #[test]
    fn confirmation_tag_agrees_across_sides() {
        let (a, b) = paired_keys();
        let na = generate_nonce();
        let nb = generate_nonce();
        let tag = a.confirmation_tag(&na, &nb);
        assert!(b.verify_confirmation(&tag, &na, &nb));
        assert!(!b.verify_confirmation(&tag, &nb, &na));
        assert!(!b.verify_confirmation(&[0u8; 32], &na, &nb));
        assert!(!b.verify_confirmation(&[0u8; 7], &na, &nb));
    }

    #[test]
    fn rotation_produces_unrelated_key() {
        // Same nonces, fresh ephemerals — the rotated key must not open
        // traffic sealed under the old one.
        let na = generate_nonce();
        let nb = generate_nonce();

        let mk = |na: &[u8], nb: &[u8]| {
            let ei = EphemeralKey::generate();
            let er = EphemeralKey::generate();
            let pr = er.public;
            let dh = ei.agree(&pr).unwrap();
            derive_session_key(&dh, na, nb, b"s").unwrap()
        };

        let mut old = mk(&na, &nb);
        let fresh = mk(&na, &nb);
        let sealed = old.seal(b"before rotation").unwrap();
        assert!(fresh.open(&sealed).is_err());
    }

    #[test]
    fn bad_public_params_rejected() {
        let eph = EphemeralKey::generate();
        assert!(matches!(
            eph.agree(&[0u8; 7]),
            Err(CryptoError::BadPublicParams)
        ));
    }
}
