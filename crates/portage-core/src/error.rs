//! Protocol error codes and categories.
//!
//! Every `Error` message on the wire carries a numeric code in [1000, 9999].
//! The thousands digit is the category band; receivers may react per-band
//! without knowing every individual code.

use serde::{Deserialize, Serialize};

// ── Codes ─────────────────────────────────────────────────────────────────────

/// Well-known error codes. The bands are:
/// 1000–1999 protocol, 2000–2999 session, 3000–3999 transfer,
/// 4000–4999 storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // protocol
    BadFraming = 1000,
    InvalidMessage = 1001,
    VersionMismatch = 1002,
    UnknownMessageType = 1003,

    // session
    HandshakeFailed = 2000,
    NotAuthenticated = 2001,
    Timeout = 2002,
    Busy = 2003,

    // transfer
    Rejected = 3000,
    IntegrityError = 3001,
    SizeExceeded = 3002,
    ChunkMissing = 3003,
    Cancelled = 3004,

    // storage
    NotFound = 4000,
    StoreFull = 4001,
    CorruptionDetected = 4002,
    StorageIo = 4003,
}

/// Category bands for the error code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Session,
    Transfer,
    Storage,
    Unassigned,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn category(&self) -> ErrorCategory {
        category_of(self.code())
    }
}

impl From<ErrorCode> for u16 {
    fn from(c: ErrorCode) -> u16 {
        c as u16
    }
}

/// Category of an arbitrary in-band code, including ones this
/// implementation does not name.
pub fn category_of(code: u16) -> ErrorCategory {
    match code {
        1000..=1999 => ErrorCategory::Protocol,
        2000..=2999 => ErrorCategory::Session,
        3000..=3999 => ErrorCategory::Transfer,
        4000..=4999 => ErrorCategory::Storage,
        _ => ErrorCategory::Unassigned,
    }
}

/// Is this code inside the legal wire range?
pub fn in_band(code: u16) -> bool {
    (1000..=9999).contains(&code)
}

// ── Wire error payload ────────────────────────────────────────────────────────

/// Body of an `Error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        category_of(self.code)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
