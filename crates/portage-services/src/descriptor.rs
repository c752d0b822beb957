//! Per-transfer state — one descriptor per `(file, peer, direction)`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use portage_core::id::{FileId, NodeId};
use portage_core::manifest::FileManifest;

// ── Direction and status ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "recv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Paused,
    Failed { reason: String },
    Completed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Failed { .. } | TransferStatus::Completed)
    }
}

// ── Transfer key ──────────────────────────────────────────────────────────────

/// Identity of one transfer. At most one live descriptor exists per key.
///
/// Rendered as `<fileId>:<peerId>:<dir>`, which is what envelope
/// correlation ids carry so inbound transfer messages route without a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub file: FileId,
    pub peer: NodeId,
    pub direction: Direction,
}

impl TransferKey {
    pub fn new(file: FileId, peer: NodeId, direction: Direction) -> Self {
        Self {
            file,
            peer,
            direction,
        }
    }

    /// The key of the counterparty's descriptor for the same transfer.
    pub fn flipped(&self, local: NodeId) -> TransferKey {
        TransferKey {
            file: self.file,
            peer: local,
            direction: match self.direction {
                Direction::Send => Direction::Receive,
                Direction::Receive => Direction::Send,
            },
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file.to_hex(),
            self.peer.to_hex(),
            self.direction.as_str()
        )
    }
}

impl FromStr for TransferKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let file = FileId::from_hex(parts.next().ok_or(())?).map_err(|_| ())?;
        let peer = NodeId::from_hex(parts.next().ok_or(())?).map_err(|_| ())?;
        let direction = match parts.next().ok_or(())? {
            "send" => Direction::Send,
            "recv" => Direction::Receive,
            _ => return Err(()),
        };
        if parts.next().is_some() {
            return Err(());
        }
        Ok(TransferKey {
            file,
            peer,
            direction,
        })
    }
}

// ── Ack bitmap ────────────────────────────────────────────────────────────────

/// Which sequences have been acknowledged (sender side) or verified and
/// stored (receiver side). One bit per sequence.
#[derive(Debug, Clone)]
pub struct AckBitmap {
    words: Vec<u64>,
    len: u64,
    count: u64,
}

impl AckBitmap {
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64) as usize],
            len,
            count: 0,
        }
    }

    /// Mark a sequence. Returns true if it was newly set.
    pub fn set(&mut self, sequence: u64) -> bool {
        assert!(sequence < self.len, "sequence {sequence} out of range");
        let (word, bit) = ((sequence / 64) as usize, sequence % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    pub fn contains(&self, sequence: u64) -> bool {
        if sequence >= self.len {
            return false;
        }
        let (word, bit) = ((sequence / 64) as usize, sequence % 64);
        self.words[word] & (1u64 << bit) != 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    /// Sequences not yet set, ascending.
    pub fn missing(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(move |s| !self.contains(*s))
    }

    /// First unset sequence at or after `from`.
    pub fn next_unset(&self, from: u64) -> Option<u64> {
        (from..self.len).find(|s| !self.contains(*s))
    }
}

// ── Descriptor ────────────────────────────────────────────────────────────────

/// The full state of one active transfer.
pub struct TransferDescriptor {
    pub key: TransferKey,
    pub manifest: FileManifest,
    pub status: TransferStatus,
    /// Sender: next sequence not yet put in flight.
    /// Receiver: lowest sequence not yet stored.
    pub cursor: u64,
    pub acked: AckBitmap,
    /// Sequences in flight and when they were last sent (sender) or
    /// resend-requested (receiver).
    pub outstanding: HashMap<u64, Instant>,
    /// Resend attempts per sequence.
    pub retries: HashMap<u64, u32>,
    pub started_at: Instant,
    pub last_progress: Instant,
    pub cancelled: bool,
}

impl TransferDescriptor {
    pub fn new(key: TransferKey, manifest: FileManifest) -> Self {
        let chunk_count = manifest.chunk_count;
        let now = Instant::now();
        Self {
            key,
            manifest,
            status: TransferStatus::Pending,
            cursor: 0,
            acked: AckBitmap::new(chunk_count),
            outstanding: HashMap::new(),
            retries: HashMap::new(),
            started_at: now,
            last_progress: now,
            cancelled: false,
        }
    }

    /// Record an acknowledged (or stored) sequence. Advances the cursor
    /// over any contiguous prefix. Returns true if the sequence was new.
    pub fn mark_acked(&mut self, sequence: u64) -> bool {
        let newly = self.acked.set(sequence);
        if newly {
            self.outstanding.remove(&sequence);
            self.last_progress = Instant::now();
            while self.cursor < self.manifest.chunk_count && self.acked.contains(self.cursor) {
                self.cursor += 1;
            }
        }
        newly
    }

    /// Bytes covered by acknowledged sequences.
    pub fn bytes_acked(&self) -> u64 {
        (0..self.manifest.chunk_count)
            .filter(|s| self.acked.contains(*s))
            .map(|s| self.manifest.chunk_len(s))
            .sum()
    }

    pub fn all_acked(&self) -> bool {
        self.acked.is_full()
    }

    /// Bump the retry counter for a sequence; Err(count) once past `max`.
    pub fn bump_retry(&mut self, sequence: u64, max: u32) -> Result<u32, u32> {
        let count = self.retries.entry(sequence).or_insert(0);
        *count += 1;
        if *count > max {
            Err(*count)
        } else {
            Ok(*count)
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Failed {
                reason: reason.into(),
            };
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
