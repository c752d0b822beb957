//! Content-addressed chunk storage and file assembly.
//!
//! On-disk layout, one tree per node:
//!
//! ```text
//! <dataDir>/
//!   chunks/<fileId>/<sequence>.<hashHex>.bin      raw chunk (or .bin.gz)
//!   files/<fileId>/<fileName>                     assembled final files
//!   meta/<fileId>.json                            manifest + chunk table
//! <tempDir>/
//!   incoming/<fileId>/<sequence>.part             in-flight writes
//! ```
//!
//! Every write verifies the bytes against the chunk's checksum before the
//! file becomes visible (write to a `.part` in the temp tree, verify, then
//! rename into place) — a torn write can never be mistaken for a chunk.
//! Assembly streams chunk-by-chunk and verifies the whole-file checksum
//! before the target is renamed into place.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use portage_core::checksum::{digest, ChecksumAlgorithm, Digester};
use portage_core::id::{ChunkId, FileId};
use portage_core::manifest::FileManifest;

/// Chunks at or above this many bytes are gzip-compressed at rest unless
/// the store is configured otherwise.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

pub struct ChunkStore {
    data_dir: PathBuf,
    temp_dir: PathBuf,
    compress_threshold: usize,
}

impl ChunkStore {
    /// Open (creating directories as needed) a store rooted at `data_dir`
    /// with in-flight writes under `temp_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_threshold(data_dir, temp_dir, DEFAULT_COMPRESS_THRESHOLD)
    }

    pub fn with_threshold(
        data_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        compress_threshold: usize,
    ) -> io::Result<Self> {
        let store = Self {
            data_dir: data_dir.into(),
            temp_dir: temp_dir.into(),
            compress_threshold,
        };
        fs::create_dir_all(store.data_dir.join("chunks"))?;
        fs::create_dir_all(store.data_dir.join("files"))?;
        fs::create_dir_all(store.data_dir.join("meta"))?;
        fs::create_dir_all(store.temp_dir.join("incoming"))?;
        Ok(store)
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    fn chunk_dir(&self, file: &FileId) -> PathBuf {
        self.data_dir.join("chunks").join(file.to_hex())
    }

    fn chunk_path(&self, id: &ChunkId, compressed: bool) -> PathBuf {
        let ext = if compressed { "bin.gz" } else { "bin" };
        self.chunk_dir(&id.file)
            .join(format!("{}.{}.{ext}", id.sequence, id.hash_hex()))
    }

    fn meta_path(&self, file: &FileId) -> PathBuf {
        self.data_dir
            .join("meta")
            .join(format!("{}.json", file.to_hex()))
    }

    /// Directory assembled files for `file` land in.
    pub fn file_dir(&self, file: &FileId) -> PathBuf {
        self.data_dir.join("files").join(file.to_hex())
    }

    /// Final path an assembled file gets, per its manifest.
    pub fn assembled_path(&self, manifest: &FileManifest) -> PathBuf {
        self.file_dir(&manifest.file_id).join(&manifest.file_name)
    }

    fn incoming_part(&self, file: &FileId, sequence: u64) -> PathBuf {
        self.temp_dir
            .join("incoming")
            .join(file.to_hex())
            .join(format!("{sequence}.part"))
    }

    // ── Chunk operations ─────────────────────────────────────────────────────

    /// Persist a chunk. Verifies the bytes against the chunk's checksum
    /// first; a second put of the same chunk is a no-op.
    pub fn put(&self, id: &ChunkId, algo: ChecksumAlgorithm, bytes: &[u8]) -> Result<(), StoreError> {
        if digest(algo, bytes) != id.content_hash {
            return Err(StoreError::Integrity(format!(
                "chunk {}/{} does not match its checksum",
                id.file, id.sequence
            )));
        }
        if self.has(id) {
            return Ok(());
        }

        let compress = bytes.len() >= self.compress_threshold;
        let part = self.incoming_part(&id.file, id.sequence);
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent)?;
        }

        {
            let file = File::create(&part)?;
            if compress {
                let mut enc = GzEncoder::new(file, Compression::default());
                enc.write_all(bytes)?;
                enc.finish()?;
            } else {
                let mut file = file;
                file.write_all(bytes)?;
                file.sync_all()?;
            }
        }

        let target = self.chunk_path(id, compress);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        move_into_place(&part, &target)?;
        Ok(())
    }

    /// Fetch a chunk's bytes, decompressing if stored gzipped. `None` if
    /// absent.
    pub fn get(&self, id: &ChunkId) -> Result<Option<Vec<u8>>, StoreError> {
        let mut reader = match self.open_read_stream(id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    pub fn has(&self, id: &ChunkId) -> bool {
        self.chunk_path(id, false).exists() || self.chunk_path(id, true).exists()
    }

    pub fn is_compressed(&self, id: &ChunkId) -> bool {
        self.chunk_path(id, true).exists()
    }

    pub fn delete(&self, id: &ChunkId) -> Result<(), StoreError> {
        for compressed in [false, true] {
            let path = self.chunk_path(id, compressed);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Chunk ids stored for a file, ordered by sequence number.
    pub fn list_for_file(&self, file: &FileId) -> Result<Vec<ChunkId>, StoreError> {
        let dir = self.chunk_dir(file);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = parse_chunk_name(file, name) {
                out.push(id);
            }
        }
        out.sort_by_key(|c| c.sequence);
        Ok(out)
    }

    /// Uncompressed byte length of a stored chunk.
    pub fn size_of(&self, id: &ChunkId) -> Result<u64, StoreError> {
        let plain = self.chunk_path(id, false);
        if plain.exists() {
            return Ok(plain.metadata()?.len());
        }
        let gz = self.chunk_path(id, true);
        if gz.exists() {
            // gzip does not record a trustworthy length for >4 GiB inputs,
            // so count by streaming
            let mut dec = GzDecoder::new(File::open(gz)?);
            return Ok(io::copy(&mut dec, &mut io::sink())?);
        }
        Err(StoreError::NotFound)
    }

    /// Total on-disk bytes across all stored chunks.
    pub fn total_size(&self) -> Result<u64, StoreError> {
        let chunks = self.data_dir.join("chunks");
        let mut total = 0;
        for dir in fs::read_dir(chunks)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(dir.path())? {
                total += entry?.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Lazily read a chunk that may exceed memory.
    pub fn open_read_stream(&self, id: &ChunkId) -> Result<Option<Box<dyn Read + Send>>, StoreError> {
        let plain = self.chunk_path(id, false);
        if plain.exists() {
            return Ok(Some(Box::new(File::open(plain)?)));
        }
        let gz = self.chunk_path(id, true);
        if gz.exists() {
            return Ok(Some(Box::new(GzDecoder::new(File::open(gz)?))));
        }
        Ok(None)
    }

    /// Lazily write a chunk that may exceed memory. The chunk becomes
    /// visible only after [`ChunkWriter::finish`] verifies its checksum.
    pub fn open_write_stream(
        &self,
        id: ChunkId,
        algo: ChecksumAlgorithm,
    ) -> Result<ChunkWriter<'_>, StoreError> {
        let part = self.incoming_part(&id.file, id.sequence);
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(ChunkWriter {
            store: self,
            id,
            digester: Digester::new(algo),
            file: File::create(&part)?,
            part,
            written: 0,
        })
    }

    /// Convert a plain stored chunk to its gzipped form.
    pub fn compress(&self, id: &ChunkId) -> Result<(), StoreError> {
        let plain = self.chunk_path(id, false);
        if !plain.exists() {
            return if self.is_compressed(id) {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            };
        }
        let gz = self.chunk_path(id, true);
        let mut src = File::open(&plain)?;
        let mut enc = GzEncoder::new(File::create(&gz)?, Compression::default());
        io::copy(&mut src, &mut enc)?;
        enc.finish()?;
        fs::remove_file(plain)?;
        Ok(())
    }

    /// Convert a gzipped stored chunk back to its plain form.
    pub fn decompress(&self, id: &ChunkId) -> Result<(), StoreError> {
        let gz = self.chunk_path(id, true);
        if !gz.exists() {
            return if self.chunk_path(id, false).exists() {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            };
        }
        let plain = self.chunk_path(id, false);
        let mut dec = GzDecoder::new(File::open(&gz)?);
        let mut dst = File::create(&plain)?;
        io::copy(&mut dec, &mut dst)?;
        fs::remove_file(gz)?;
        Ok(())
    }

    // ── Manifests ────────────────────────────────────────────────────────────

    pub fn save_manifest(&self, manifest: &FileManifest) -> Result<(), StoreError> {
        let path = self.meta_path(&manifest.file_id);
        let json = serde_json::to_vec_pretty(manifest)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_manifest(&self, file: &FileId) -> Result<Option<FileManifest>, StoreError> {
        let path = self.meta_path(file);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    // ── Import ───────────────────────────────────────────────────────────────

    /// Chunk a local file into the store and persist its manifest.
    ///
    /// Two streaming passes: the first computes per-chunk and whole-file
    /// checksums (which determine the file id), the second writes chunks
    /// under that id. The file is never held in memory.
    pub fn import_file(
        &self,
        path: &Path,
        chunk_size: u64,
        algo: ChecksumAlgorithm,
    ) -> Result<FileManifest, StoreError> {
        use portage_core::manifest::ChunkChecksumEntry;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let file_size = fs::metadata(path)?.len();

        // Pass 1: checksums
        let mut whole = Digester::new(algo);
        let mut chunk_checksums = Vec::new();
        {
            let mut reader = File::open(path)?;
            let mut buf = vec![0u8; chunk_size as usize];
            let mut sequence = 0u64;
            loop {
                let n = read_up_to(&mut reader, &mut buf)?;
                if n == 0 {
                    break;
                }
                whole.update(&buf[..n]);
                chunk_checksums.push(ChunkChecksumEntry {
                    sequence,
                    checksum: digest(algo, &buf[..n]),
                });
                sequence += 1;
            }
        }
        let checksum = whole.finalize();

        // The file id is the hash of the metadata block, so identical
        // content chunked the same way gets the same id on every node.
        let mut id_input = Vec::new();
        id_input.extend_from_slice(file_name.as_bytes());
        id_input.extend_from_slice(&file_size.to_le_bytes());
        id_input.extend_from_slice(&chunk_size.to_le_bytes());
        id_input.extend_from_slice(&checksum);
        let file_id = FileId::derive(&id_input);

        let manifest = FileManifest {
            file_id,
            file_name,
            file_size,
            chunk_size,
            chunk_count: FileManifest::chunk_count_for(file_size, chunk_size),
            checksum,
            checksum_algorithm: algo,
            chunk_checksums: Some(chunk_checksums.clone()),
        };
        manifest
            .validate()
            .map_err(|e| StoreError::BadManifest(e.to_string()))?;

        // Pass 2: store chunks
        {
            let mut reader = File::open(path)?;
            let mut buf = vec![0u8; chunk_size as usize];
            for entry in &chunk_checksums {
                let n = read_up_to(&mut reader, &mut buf)?;
                let id = ChunkId::new(file_id, entry.sequence, entry.checksum.clone());
                self.put(&id, algo, &buf[..n])?;
            }
        }

        self.save_manifest(&manifest)?;
        Ok(manifest)
    }

    // ── Assembly ─────────────────────────────────────────────────────────────

    /// Concatenate all chunks of a file, in sequence order, into
    /// `target_path`, verifying the whole-file checksum against the
    /// manifest. The target appears only if verification succeeds.
    pub fn assemble(&self, manifest: &FileManifest, target_path: &Path) -> Result<(), StoreError> {
        let chunks = self.list_for_file(&manifest.file_id)?;
        if chunks.len() as u64 != manifest.chunk_count {
            let present: HashSet<u64> = chunks.iter().map(|c| c.sequence).collect();
            let missing = (0..manifest.chunk_count)
                .find(|seq| !present.contains(seq))
                .unwrap_or(manifest.chunk_count);
            return Err(StoreError::MissingChunk(missing));
        }
        for (expected, chunk) in chunks.iter().enumerate() {
            if chunk.sequence != expected as u64 {
                return Err(StoreError::MissingChunk(expected as u64));
            }
        }

        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let part_path = target_path.with_extension("assembling");

        let mut digester = Digester::new(manifest.checksum_algorithm);
        let mut written = 0u64;
        {
            let mut out = File::create(&part_path)?;
            let mut buf = vec![0u8; 64 * 1024];
            for chunk in &chunks {
                let mut reader = self
                    .open_read_stream(chunk)?
                    .ok_or(StoreError::NotFound)?;
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    digester.update(&buf[..n]);
                    out.write_all(&buf[..n])?;
                    written += n as u64;
                }
            }
            out.sync_all()?;
        }

        if written != manifest.file_size {
            fs::remove_file(&part_path).ok();
            return Err(StoreError::Integrity(format!(
                "assembled {} bytes, manifest says {}",
                written, manifest.file_size
            )));
        }
        if digester.finalize() != manifest.checksum {
            fs::remove_file(&part_path).ok();
            return Err(StoreError::Integrity(
                "assembled file does not match manifest checksum".to_string(),
            ));
        }

        fs::rename(&part_path, target_path)?;
        tracing::info!(
            file = %manifest.file_id,
            name = %manifest.file_name,
            bytes = manifest.file_size,
            chunks = manifest.chunk_count,
            path = %target_path.display(),
            "file assembled and verified"
        );
        Ok(())
    }

    // ── Cleanup ──────────────────────────────────────────────────────────────

    /// Remove chunk trees not referenced by any active transfer or
    /// assembled file, plus stale in-flight parts, once older than
    /// `max_age`. Returns how many directories were removed.
    pub fn cleanup_orphans(
        &self,
        referenced: &HashSet<FileId>,
        max_age: Duration,
    ) -> Result<usize, StoreError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        let chunks = self.data_dir.join("chunks");
        for entry in fs::read_dir(&chunks)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(file_id) = FileId::from_hex(name) else {
                continue;
            };
            if referenced.contains(&file_id) || self.file_dir(&file_id).exists() {
                continue;
            }
            if newest_mtime(&entry.path())? > cutoff {
                continue;
            }
            tracing::debug!(file = %file_id, "removing orphaned chunks");
            fs::remove_dir_all(entry.path())?;
            fs::remove_file(self.meta_path(&file_id)).ok();
            removed += 1;
        }

        let incoming = self.temp_dir.join("incoming");
        for entry in fs::read_dir(&incoming)? {
            let entry = entry?;
            if newest_mtime(&entry.path())? <= cutoff {
                fs::remove_dir_all(entry.path())?;
            }
        }

        Ok(removed)
    }

    /// Drop all stored chunks for a file (cancelled receive).
    pub fn delete_file_chunks(&self, file: &FileId) -> Result<(), StoreError> {
        let dir = self.chunk_dir(file);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        let incoming = self.temp_dir.join("incoming").join(file.to_hex());
        if incoming.exists() {
            fs::remove_dir_all(incoming)?;
        }
        Ok(())
    }
}

/// Rename, falling back to copy+remove when the temp tree lives on a
/// different filesystem than the data tree.
fn move_into_place(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Read until the buffer is full or the source is exhausted.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Newest modification time under a path (the path itself for files).
fn newest_mtime(path: &Path) -> io::Result<SystemTime> {
    let meta = fs::metadata(path)?;
    let mut newest = meta.modified()?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            let m = entry?.metadata()?.modified()?;
            if m > newest {
                newest = m;
            }
        }
    }
    Ok(newest)
}

/// Parse `<sequence>.<hashHex>.bin[.gz]` into a ChunkId.
fn parse_chunk_name(file: &FileId, name: &str) -> Option<ChunkId> {
    let rest = name
        .strip_suffix(".bin.gz")
        .or_else(|| name.strip_suffix(".bin"))?;
    let (seq, hash_hex) = rest.split_once('.')?;
    let sequence = seq.parse().ok()?;
    let content_hash = hex::decode(hash_hex).ok()?;
    Some(ChunkId::new(*file, sequence, content_hash))
}

// ── Streaming writer ──────────────────────────────────────────────────────────

/// In-flight chunk write. Data lands in `<tempDir>/incoming/` and moves
/// into the store only when `finish` verifies the checksum.
pub struct ChunkWriter<'a> {
    store: &'a ChunkStore,
    id: ChunkId,
    digester: Digester,
    file: File,
    part: PathBuf,
    written: u64,
}

impl ChunkWriter<'_> {
    pub fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        self.digester.update(data);
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Verify and commit. The part file is discarded on any failure.
    pub fn finish(self) -> Result<(), StoreError> {
        self.file.sync_all()?;
        drop(self.file);

        if self.digester.finalize() != self.id.content_hash {
            fs::remove_file(&self.part).ok();
            return Err(StoreError::Integrity(format!(
                "streamed chunk {}/{} does not match its checksum",
                self.id.file, self.id.sequence
            )));
        }

        let compress = self.written >= self.store.compress_threshold as u64;
        let target = self.store.chunk_path(&self.id, compress);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if compress {
            let mut src = File::open(&self.part)?;
            let mut enc = GzEncoder::new(File::create(&target)?, Compression::default());
            io::copy(&mut src, &mut enc)?;
            enc.finish()?;
            fs::remove_file(&self.part)?;
        } else {
            move_into_place(&self.part, &target)?;
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("chunk not found")]
    NotFound,

    #[error("missing chunk at sequence {0}")]
    MissingChunk(u64),

    #[error("bad manifest: {0}")]
    BadManifest(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use portage_core::checksum::ChecksumAlgorithm::Blake3;

    fn test_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("data"), dir.path().join("tmp")).unwrap();
        (dir, store)
    }

    fn chunk(file: &FileId, seq: u64, bytes: &[u8]) -> ChunkId {
        ChunkId::new(*file, seq, digest(Blake3, bytes))
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        let id = chunk(&file, 0, b"hello chunk");
        store.put(&id, Blake3, b"hello chunk").unwrap();
        assert!(store.has(&id));
        assert_eq!(store.get(&id).unwrap().unwrap(), b"hello chunk");
        assert_eq!(store.size_of(&id).unwrap(), 11);
    }

    #[test]
    fn put_rejects_checksum_mismatch() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        let id = chunk(&file, 0, b"expected bytes");
        let err = store.put(&id, Blake3, b"different bytes").unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(!store.has(&id));
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        let id = chunk(&file, 3, b"same");
        store.put(&id, Blake3, b"same").unwrap();
        store.put(&id, Blake3, b"same").unwrap();
        assert_eq!(store.list_for_file(&file).unwrap().len(), 1);
    }

    #[test]
    fn large_chunks_are_compressed_at_rest() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        // highly compressible and above the 1024-byte threshold
        let big = vec![0x42u8; 8192];
        let id = chunk(&file, 0, &big);
        store.put(&id, Blake3, &big).unwrap();
        assert!(store.is_compressed(&id));
        assert_eq!(store.get(&id).unwrap().unwrap(), big);
        assert_eq!(store.size_of(&id).unwrap(), 8192);

        let small = b"tiny";
        let id2 = chunk(&file, 1, small);
        store.put(&id2, Blake3, small).unwrap();
        assert!(!store.is_compressed(&id2));
    }

    #[test]
    fn compress_and_decompress_convert_in_place() {
        let (_dir, store) = test_store();
        let store = ChunkStore::with_threshold(
            store.data_dir.clone(),
            store.temp_dir.clone(),
            usize::MAX, // never auto-compress
        )
        .unwrap();
        let file = FileId::derive(b"f");
        let bytes = vec![7u8; 4096];
        let id = chunk(&file, 0, &bytes);
        store.put(&id, Blake3, &bytes).unwrap();
        assert!(!store.is_compressed(&id));

        store.compress(&id).unwrap();
        assert!(store.is_compressed(&id));
        assert_eq!(store.get(&id).unwrap().unwrap(), bytes);

        store.decompress(&id).unwrap();
        assert!(!store.is_compressed(&id));
        assert_eq!(store.get(&id).unwrap().unwrap(), bytes);
    }

    #[test]
    fn list_for_file_orders_by_sequence() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        for seq in [5u64, 1, 3, 0, 2, 4] {
            let bytes = format!("chunk-{seq}");
            let id = chunk(&file, seq, bytes.as_bytes());
            store.put(&id, Blake3, bytes.as_bytes()).unwrap();
        }
        let listed = store.list_for_file(&file).unwrap();
        let sequences: Vec<u64> = listed.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn delete_removes_chunk() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        let id = chunk(&file, 0, b"bye");
        store.put(&id, Blake3, b"bye").unwrap();
        store.delete(&id).unwrap();
        assert!(!store.has(&id));
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn streaming_writer_verifies_on_finish() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"f");
        let bytes = b"streamed in two pieces";
        let id = chunk(&file, 0, bytes);

        let mut w = store.open_write_stream(id.clone(), Blake3).unwrap();
        w.write(&bytes[..8]).unwrap();
        w.write(&bytes[8..]).unwrap();
        w.finish().unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap(), bytes);

        // wrong bytes never become visible
        let bad_id = chunk(&file, 1, b"expected");
        let mut w = store.open_write_stream(bad_id.clone(), Blake3).unwrap();
        w.write(b"not the expected bytes").unwrap();
        assert!(matches!(w.finish(), Err(StoreError::Integrity(_))));
        assert!(!store.has(&bad_id));
    }

    #[test]
    fn import_then_assemble_round_trips_file() {
        let (dir, store) = test_store();
        let src = dir.path().join("source.bin");
        // 3 chunks: two full 4 KiB + one short
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).unwrap();

        let manifest = store.import_file(&src, 4096, Blake3).unwrap();
        assert_eq!(manifest.chunk_count, 3);
        assert_eq!(manifest.file_size, 10_000);
        assert_eq!(store.list_for_file(&manifest.file_id).unwrap().len(), 3);
        assert!(store.load_manifest(&manifest.file_id).unwrap().is_some());

        let target = store.assembled_path(&manifest);
        store.assemble(&manifest, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), data);
    }

    #[test]
    fn assemble_fails_on_missing_chunk() {
        let (dir, store) = test_store();
        let src = dir.path().join("source.bin");
        let data = vec![9u8; 12_000];
        fs::write(&src, &data).unwrap();

        let manifest = store.import_file(&src, 4096, Blake3).unwrap();
        let chunks = store.list_for_file(&manifest.file_id).unwrap();
        store.delete(&chunks[1]).unwrap();

        let target = store.assembled_path(&manifest);
        assert!(matches!(
            store.assemble(&manifest, &target),
            Err(StoreError::MissingChunk(1))
        ));
        assert!(!target.exists());
    }

    #[test]
    fn assemble_fails_on_checksum_mismatch() {
        let (dir, store) = test_store();
        let src = dir.path().join("source.bin");
        let data = vec![1u8; 8192];
        fs::write(&src, &data).unwrap();

        let mut manifest = store.import_file(&src, 4096, Blake3).unwrap();
        // sabotage the manifest's whole-file checksum
        manifest.checksum = digest(Blake3, b"something else");

        let target = store.assembled_path(&manifest);
        assert!(matches!(
            store.assemble(&manifest, &target),
            Err(StoreError::Integrity(_))
        ));
        assert!(!target.exists());
    }

    #[test]
    fn cleanup_removes_only_aged_unreferenced_chunks() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"orphan");
        let id = chunk(&file, 0, b"stale");
        store.put(&id, Blake3, b"stale").unwrap();

        // referenced → kept even at zero age
        let mut referenced = HashSet::new();
        referenced.insert(file);
        assert_eq!(
            store.cleanup_orphans(&referenced, Duration::ZERO).unwrap(),
            0
        );
        assert!(store.has(&id));

        // unreferenced but younger than max_age → kept
        let empty = HashSet::new();
        assert_eq!(
            store
                .cleanup_orphans(&empty, Duration::from_secs(3600))
                .unwrap(),
            0
        );
        assert!(store.has(&id));

        // unreferenced and aged → removed
        assert_eq!(store.cleanup_orphans(&empty, Duration::ZERO).unwrap(), 1);
        assert!(!store.has(&id));
    }

    #[test]
    fn delete_file_chunks_clears_partial_receive() {
        let (_dir, store) = test_store();
        let file = FileId::derive(b"partial");
        for seq in 0..4u64 {
            let bytes = format!("part-{seq}");
            let id = chunk(&file, seq, bytes.as_bytes());
            store.put(&id, Blake3, bytes.as_bytes()).unwrap();
        }
        store.delete_file_chunks(&file).unwrap();
        assert!(store.list_for_file(&file).unwrap().is_empty());
    }
}
