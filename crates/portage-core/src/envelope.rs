//! Portage wire format — the length-framed envelope around every message.
//!
//! These layouts ARE the protocol. Every field, every size, every limit is
//! part of the wire format and changing any of them is a breaking change.
//!
//! An envelope is a fixed prefix followed by an opaque payload:
//!
//! ```text
//! offset  size  field
//! 0       4     magic          0x43415446, little-endian
//! 4       2     envelope version (currently 1)
//! 6       ..    messageId      varint length + UTF-8
//! ..      ..    messageType    varint length + UTF-8
//! ..      ..    sourceNodeId   varint length + UTF-8
//! ..      ..    destNodeId     varint length + UTF-8 (empty = broadcast)
//! ..      ..    correlationId  varint length + UTF-8 (empty = none)
//! ..      8     timestampUtc   int64 ticks since 0001-01-01 UTC
//! ..      ..    format         varint length + UTF-8 ("json"|"protobuf"|"binary")
//! ..      4     payloadSize    int32
//! ..      N     payload        opaque bytes
//! ```
//!
//! The header can be peeked without touching the payload, which lets the
//! dispatcher route by message type and destination without paying decode
//! cost for payloads it merely forwards.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::id::new_message_id;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Envelope magic, spells "FTAC" on the wire in little-endian byte order.
pub const MAGIC: u32 = 0x4341_5446;

/// Current envelope layout version.
pub const ENVELOPE_VERSION: u16 = 1;

/// Hard cap on a whole envelope. Anything larger is rejected before the
/// payload is read.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

/// Hard cap on the payload alone.
pub const MAX_PAYLOAD_BYTES: usize = 15 * 1024 * 1024;

/// Cap on any single header string. Identifiers are short; a longer length
/// prefix means the stream is corrupt.
const MAX_HEADER_STRING: usize = 1024;

/// Ticks (100 ns units) per second, .NET epoch convention.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks between 0001-01-01 and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Current wall clock as envelope ticks.
pub fn ticks_now() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    UNIX_EPOCH_TICKS
        + now.as_secs() as i64 * TICKS_PER_SECOND
        + (now.subsec_nanos() / 100) as i64
}

// ── Payload format ────────────────────────────────────────────────────────────

/// Serialization format of the payload, negotiated per envelope.
///
/// Only JSON payloads are produced; the other labels are accepted on decode
/// for forward compatibility and their payloads are still parsed as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Protobuf,
    Binary,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "json",
            PayloadFormat::Protobuf => "protobuf",
            PayloadFormat::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CodecError> {
        match s {
            "json" => Ok(PayloadFormat::Json),
            "protobuf" => Ok(PayloadFormat::Protobuf),
            "binary" => Ok(PayloadFormat::Binary),
            _ => Err(CodecError::BadFraming("unknown payload format")),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A decoded envelope: routing header plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: String,
    pub message_type: String,
    /// Sending node, hex form.
    pub source: String,
    /// Destination node, hex form. Empty string = broadcast.
    pub dest: String,
    /// Request/response correlation. Empty string = none.
    pub correlation: String,
    /// Ticks since 0001-01-01 UTC at send time.
    pub timestamp_ticks: i64,
    pub format: PayloadFormat,
    pub payload: Bytes,
}

/// Header fields only, produced by [`Envelope::peek`] without decoding the
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeHead {
    pub message_id: String,
    pub message_type: String,
    pub source: String,
    pub dest: String,
    pub correlation: String,
    pub timestamp_ticks: i64,
    pub format: PayloadFormat,
    pub payload_len: usize,
    /// Byte offset where the payload starts.
    pub header_len: usize,
}

impl EnvelopeHead {
    /// Total envelope size in bytes, header plus payload.
    pub fn total_len(&self) -> usize {
        self.header_len + self.payload_len
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest.is_empty()
    }
}

impl Envelope {
    /// Build an envelope around already-serialized payload bytes, stamping a
    /// fresh message id and the current time.
    pub fn new(
        message_type: impl Into<String>,
        source: impl Into<String>,
        dest: impl Into<String>,
        correlation: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            message_type: message_type.into(),
            source: source.into(),
            dest: dest.into(),
            correlation: correlation.into(),
            timestamp_ticks: ticks_now(),
            format: PayloadFormat::Json,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest.is_empty()
    }

    /// Encode to a self-delimited byte string.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        buf.put_u32_le(MAGIC);
        buf.put_u16_le(ENVELOPE_VERSION);
        put_string(&mut buf, &self.message_id)?;
        put_string(&mut buf, &self.message_type)?;
        put_string(&mut buf, &self.source)?;
        put_string(&mut buf, &self.dest)?;
        put_string(&mut buf, &self.correlation)?;
        buf.put_i64_le(self.timestamp_ticks);
        put_string(&mut buf, self.format.as_str())?;
        buf.put_i32_le(self.payload.len() as i32);
        buf.extend_from_slice(&self.payload);

        if buf.len() > MAX_ENVELOPE_BYTES {
            return Err(CodecError::EnvelopeTooLarge(buf.len()));
        }
        Ok(buf.freeze())
    }

    /// Read the header fields from a buffer prefix without touching the
    /// payload. Returns [`CodecError::Incomplete`] if more bytes are needed.
    pub fn peek(buf: &[u8]) -> Result<EnvelopeHead, CodecError> {
        let mut r = Reader::new(buf);

        let magic = r.get_u32_le()?;
        if magic != MAGIC {
            return Err(CodecError::BadFraming("magic mismatch"));
        }
        let version = r.get_u16_le()?;
        if version != ENVELOPE_VERSION {
            return Err(CodecError::BadFraming("unsupported envelope version"));
        }

        let message_id = r.get_string()?;
        let message_type = r.get_string()?;
        let source = r.get_string()?;
        let dest = r.get_string()?;
        let correlation = r.get_string()?;
        let timestamp_ticks = r.get_i64_le()?;
        let format = PayloadFormat::parse(&r.get_string()?)?;

        let payload_size = r.get_i32_le()?;
        if payload_size < 0 {
            return Err(CodecError::BadFraming("negative payload size"));
        }
        let payload_len = payload_size as usize;
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }

        let header_len = r.position();
        if header_len + payload_len > MAX_ENVELOPE_BYTES {
            return Err(CodecError::EnvelopeTooLarge(header_len + payload_len));
        }

        Ok(EnvelopeHead {
            message_id,
            message_type,
            source,
            dest,
            correlation,
            timestamp_ticks,
            format,
            payload_len,
            header_len,
        })
    }

    /// Decode one complete envelope from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Envelope, CodecError> {
        let head = Self::peek(buf)?;
        if buf.len() < head.total_len() {
            return Err(CodecError::Incomplete);
        }
        let payload = Bytes::copy_from_slice(&buf[head.header_len..head.total_len()]);
        Ok(Envelope {
            message_id: head.message_id,
            message_type: head.message_type,
            source: head.source,
            dest: head.dest,
            correlation: head.correlation,
            timestamp_ticks: head.timestamp_ticks,
            format: head.format,
            payload,
        })
    }

    /// Try to split one envelope off the front of a streaming read buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// envelope; the caller reads more bytes and retries. Framing errors are
    /// fatal to the stream.
    pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        let head = match Self::peek(buf) {
            Ok(head) => head,
            Err(CodecError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        if buf.len() < head.total_len() {
            return Ok(None);
        }
        let frame = buf.split_to(head.total_len());
        let payload = Bytes::copy_from_slice(&frame[head.header_len..]);
        Ok(Some(Envelope {
            message_id: head.message_id,
            message_type: head.message_type,
            source: head.source,
            dest: head.dest,
            correlation: head.correlation,
            timestamp_ticks: head.timestamp_ticks,
            format: head.format,
            payload,
        }))
    }
}

// ── Varint plumbing ───────────────────────────────────────────────────────────

/// Write an unsigned LEB128 varint.
fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Write a varint length prefix followed by UTF-8 bytes.
fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    if s.len() > MAX_HEADER_STRING {
        return Err(CodecError::BadFraming("header string too long"));
    }
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Cursor over a byte slice. Every read distinguishes "not enough bytes yet"
/// from "the bytes are wrong".
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u32_le(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn get_i32_le(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_i64_le(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for shift in 0..5 {
            let byte = self.take(1)?[0];
            value |= u64::from(byte & 0x7f) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        // 5 continuation bytes would encode > 32 bits — corrupt prefix
        Err(CodecError::BadFraming("varint too long"))
    }

    fn get_string(&mut self) -> Result<String, CodecError> {
        let len = self.get_varint()? as usize;
        if len > MAX_HEADER_STRING {
            return Err(CodecError::BadFraming("header string too long"));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::BadFraming("header string is not UTF-8"))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// More bytes are needed. Not an error on a live stream.
    #[error("truncated envelope")]
    Incomplete,

    #[error("bad framing: {0}")]
    BadFraming(&'static str),

    #[error("payload size {0} exceeds maximum {MAX_PAYLOAD_BYTES}")]
    PayloadTooLarge(usize),

    #[error("envelope size {0} exceeds maximum {MAX_ENVELOPE_BYTES}")]
    EnvelopeTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            message_id: "msg-0001".into(),
            message_type: "Heartbeat".into(),
            source: "aa".repeat(16),
            dest: "bb".repeat(16),
            correlation: "corr-7".into(),
            timestamp_ticks: ticks_now(),
            format: PayloadFormat::Json,
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let original = sample();
        let bytes = original.encode().unwrap();
        let recovered = Envelope::decode(&bytes).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn peek_reads_header_without_payload() {
        let original = sample();
        let bytes = original.encode().unwrap();
        let head = Envelope::peek(&bytes).unwrap();
        assert_eq!(head.message_type, "Heartbeat");
        assert_eq!(head.source, original.source);
        assert_eq!(head.payload_len, 2);
        assert_eq!(head.total_len(), bytes.len());
    }

    #[test]
    fn peek_works_on_header_prefix_alone() {
        let mut original = sample();
        original.payload = Bytes::from(vec![0u8; 4096]);
        let bytes = original.encode().unwrap();
        let head = Envelope::peek(&bytes).unwrap();
        // Header bytes alone are enough — chop the payload off entirely
        let head2 = Envelope::peek(&bytes[..head.header_len]).unwrap();
        assert_eq!(head2, head);
    }

    #[test]
    fn magic_mismatch_is_bad_framing() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::BadFraming("magic mismatch"))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[4] = 0x7f;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::BadFraming(_))
        ));
    }

    #[test]
    fn oversize_payload_rejected_before_allocation() {
        // Hand-craft a header that declares a payload over the cap. decode
        // must reject from the declared size alone — no payload bytes follow.
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAGIC);
        buf.put_u16_le(ENVELOPE_VERSION);
        for s in ["id", "FileChunk", "aa", "bb", ""] {
            put_string(&mut buf, s).unwrap();
        }
        buf.put_i64_le(ticks_now());
        put_string(&mut buf, "json").unwrap();
        buf.put_i32_le((MAX_PAYLOAD_BYTES + 1) as i32);

        assert!(matches!(
            Envelope::decode(&buf),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn negative_payload_size_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAGIC);
        buf.put_u16_le(ENVELOPE_VERSION);
        for s in ["id", "Ack", "aa", "", ""] {
            put_string(&mut buf, s).unwrap();
        }
        buf.put_i64_le(0);
        put_string(&mut buf, "json").unwrap();
        buf.put_i32_le(-1);

        assert!(matches!(
            Envelope::decode(&buf),
            Err(CodecError::BadFraming(_))
        ));
    }

    #[test]
    fn truncated_buffer_is_incomplete() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::Incomplete)
        ));
        assert!(matches!(
            Envelope::peek(&bytes[..3]),
            Err(CodecError::Incomplete)
        ));
    }

    #[test]
    fn decode_from_waits_for_full_frame() {
        let original = sample();
        let bytes = original.encode().unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..10]);
        assert!(Envelope::decode_from(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[10..]);
        let out = Envelope::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(out, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_from_splits_back_to_back_frames() {
        let a = sample();
        let mut b = sample();
        b.message_type = "Ack".into();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode().unwrap());
        buf.extend_from_slice(&b.encode().unwrap());

        let first = Envelope::decode_from(&mut buf).unwrap().unwrap();
        let second = Envelope::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(first.message_type, "Heartbeat");
        assert_eq!(second.message_type, "Ack");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_dest_means_broadcast() {
        let mut e = sample();
        e.dest = String::new();
        assert!(e.is_broadcast());
        let head = Envelope::peek(&e.encode().unwrap()).unwrap();
        assert!(head.is_broadcast());
    }

    #[test]
    fn unknown_format_rejected() {
        assert!(PayloadFormat::parse("xml").is_err());
        assert_eq!(PayloadFormat::parse("json").unwrap(), PayloadFormat::Json);
        assert_eq!(
            PayloadFormat::parse("protobuf").unwrap(),
            PayloadFormat::Protobuf
        );
    }

    #[test]
    fn varint_round_trip_boundaries() {
        for len in [0usize, 1, 127, 128, 300, MAX_HEADER_STRING] {
            let mut buf = BytesMut::new();
            let s = "x".repeat(len);
            put_string(&mut buf, &s).unwrap();
            let mut r = Reader::new(&buf);
            assert_eq!(r.get_string().unwrap(), s);
        }
    }

    #[test]
    fn ticks_are_after_unix_epoch() {
        assert!(ticks_now() > UNIX_EPOCH_TICKS);
    }
}
