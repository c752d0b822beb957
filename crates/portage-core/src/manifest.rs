//! File manifests — the per-file metadata block exchanged before any chunk.

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::id::FileId;
use crate::message::b64;

/// Smallest permitted chunk size: 4 KiB.
pub const MIN_CHUNK_SIZE: u64 = 4 * 1024;

/// Largest permitted chunk size: 1 MiB.
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Per-file metadata, fixed for the lifetime of a transfer.
///
/// Doubles as the `FileMetadata` wire payload and the persisted
/// `meta/<fileId>.json` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifest {
    pub file_id: FileId,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    /// Whole-file checksum under `checksum_algorithm`.
    #[serde(with = "b64")]
    pub checksum: Vec<u8>,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Per-chunk checksums in sequence order. Optional on the wire; always
    /// present for files imported locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_checksums: Option<Vec<ChunkChecksumEntry>>,
}

/// One entry of the optional per-chunk checksum table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkChecksumEntry {
    pub sequence: u64,
    #[serde(with = "b64")]
    pub checksum: Vec<u8>,
}

impl FileManifest {
    /// Number of chunks a file of `file_size` splits into at `chunk_size`.
    pub fn chunk_count_for(file_size: u64, chunk_size: u64) -> u64 {
        if file_size == 0 {
            0
        } else {
            file_size.div_ceil(chunk_size)
        }
    }

    /// Byte length of the chunk at `sequence` (the last chunk may be short).
    pub fn chunk_len(&self, sequence: u64) -> u64 {
        if sequence + 1 < self.chunk_count {
            self.chunk_size
        } else {
            self.file_size - self.chunk_size * (self.chunk_count - 1)
        }
    }

    /// Structural validation: chunk size in range, chunk count consistent
    /// with size, checksum length matching the algorithm.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ManifestError::ChunkSizeOutOfRange(self.chunk_size));
        }
        if self.chunk_count != Self::chunk_count_for(self.file_size, self.chunk_size) {
            return Err(ManifestError::ChunkCountMismatch {
                declared: self.chunk_count,
                expected: Self::chunk_count_for(self.file_size, self.chunk_size),
            });
        }
        if self.checksum.len() != self.checksum_algorithm.digest_len() {
            return Err(ManifestError::ChecksumLength {
                got: self.checksum.len(),
                want: self.checksum_algorithm.digest_len(),
            });
        }
        if let Some(table) = &self.chunk_checksums {
            if table.len() as u64 != self.chunk_count {
                return Err(ManifestError::ChunkTableLength {
                    got: table.len() as u64,
                    want: self.chunk_count,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("chunk size {0} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]")]
    ChunkSizeOutOfRange(u64),

    #[error("chunk count {declared} does not match file size (expected {expected})")]
    ChunkCountMismatch { declared: u64, expected: u64 },

    #[error("checksum is {got} bytes, algorithm produces {want}")]
    ChecksumLength { got: usize, want: usize },

    #[error("chunk checksum table has {got} entries, expected {want}")]
    ChunkTableLength { got: u64, want: u64 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::digest;

    fn manifest(file_size: u64, chunk_size: u64) -> FileManifest {
        FileManifest {
            file_id: FileId::derive(b"test"),
            file_name: "test.bin".into(),
            file_size,
            chunk_size,
            chunk_count: FileManifest::chunk_count_for(file_size, chunk_size),
            checksum: digest(ChecksumAlgorithm::Sha256, b"whatever"),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            chunk_checksums: None,
        }
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(FileManifest::chunk_count_for(0, 65536), 0);
        assert_eq!(FileManifest::chunk_count_for(1, 65536), 1);
        assert_eq!(FileManifest::chunk_count_for(65536, 65536), 1);
        assert_eq!(FileManifest::chunk_count_for(65537, 65536), 2);
        // the S1 scenario: 5 MiB at 64 KiB = 80 chunks
        assert_eq!(FileManifest::chunk_count_for(5_242_880, 65_536), 80);
    }

    #[test]
    fn last_chunk_may_be_short() {
        let m = manifest(100_000, 65536);
        assert_eq!(m.chunk_count, 2);
        assert_eq!(m.chunk_len(0), 65536);
        assert_eq!(m.chunk_len(1), 100_000 - 65536);
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(manifest(5_242_880, 65_536).validate().is_ok());
    }

    #[test]
    fn validate_rejects_chunk_size_out_of_range() {
        let mut m = manifest(100_000, 65536);
        m.chunk_size = 1024; // below 4 KiB
        assert!(matches!(
            m.validate(),
            Err(ManifestError::ChunkSizeOutOfRange(_))
        ));

        let mut m = manifest(100_000, 65536);
        m.chunk_size = 2 * 1024 * 1024; // above 1 MiB
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_chunk_count() {
        let mut m = manifest(100_000, 65536);
        m.chunk_count = 99;
        assert!(matches!(
            m.validate(),
            Err(ManifestError::ChunkCountMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_wrong_checksum_length() {
        let mut m = manifest(100_000, 65536);
        m.checksum = vec![0u8; 16];
        assert!(matches!(
            m.validate(),
            Err(ManifestError::ChecksumLength { .. })
        ));
    }

    #[test]
    fn manifest_json_round_trip() {
        let m = manifest(5_242_880, 65_536);
        let json = serde_json::to_string(&m).unwrap();
        // wire field names are camelCase
        assert!(json.contains("\"fileId\""));
        assert!(json.contains("\"chunkSize\""));
        assert!(json.contains("\"checksumAlgorithm\":1"));
        let back: FileManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
