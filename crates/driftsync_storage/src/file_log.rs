//! Append-only file log backend for persistent storage.

use crate::backend::KvBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 4096;

/// Frame opcode: key was written.
const OP_PUT: u8 = 1;
/// Frame opcode: key was removed.
const OP_DELETE: u8 = 2;

/// Size of the fixed frame header (opcode + key length + value length).
const HEADER_LEN: usize = 1 + 4 + 4;
/// Size of the trailing checksum.
const CRC_LEN: usize = 4;

/// A persistent key-value backend built on an append-only log.
///
/// Every `put` and `delete` appends a checksummed frame. On open, the log is
/// replayed to rebuild the key-value state. A torn or corrupt tail (from a
/// crash mid-write) is detected by the checksum and discarded; everything
/// before it is preserved.
///
/// # Durability
///
/// - Each write is appended and flushed to the OS immediately
/// - `flush()` calls `File::sync_all()` so data survives power loss
///
/// # Compaction
///
/// The log grows with every write. [`FileLogBackend::compact`] rewrites the
/// live state into a fresh log and atomically swaps it into place.
///
/// # Example
///
/// ```no_run
/// use driftsync_storage::{FileLogBackend, KvBackend};
/// use std::path::Path;
///
/// let backend = FileLogBackend::open(Path::new("queue.log")).unwrap();
/// backend.put("mutation:1", b"record").unwrap();
/// backend.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileLogBackend {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    entries: BTreeMap<String, Vec<u8>>,
    /// Number of frames written since the last compaction.
    frames_written: u64,
}

impl FileLogBackend {
    /// Opens or creates a file log at the given path.
    ///
    /// Existing frames are replayed to rebuild state. A corrupt tail is
    /// truncated away with a warning rather than failing the open.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (entries, valid_len, frames) = replay(&mut file, path)?;

        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file,
                entries,
                frames_written: frames,
            }),
        })
    }

    /// Opens a file log, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of frames appended since the last compaction.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.inner.lock().frames_written
    }

    /// Rewrites the log to contain only live entries.
    ///
    /// The new log is written to a sibling file, synced, and atomically
    /// renamed over the old one.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite or rename fails.
    pub fn compact(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        for (key, value) in &inner.entries {
            let frame = encode_frame(OP_PUT, key, value)?;
            tmp.write_all(&frame)?;
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        inner.file = tmp;
        inner.frames_written = inner.entries.len() as u64;
        Ok(())
    }

    fn append_frame(&self, op: u8, key: &str, value: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(op, key, value)?;
        let mut inner = self.inner.lock();
        inner.file.write_all(&frame)?;
        inner.file.flush()?;
        inner.frames_written += 1;
        match op {
            OP_PUT => {
                inner.entries.insert(key.to_string(), value.to_vec());
            }
            _ => {
                inner.entries.remove(key);
            }
        }
        Ok(())
    }
}

impl KvBackend for FileLogBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.append_frame(OP_PUT, key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        if self.inner.lock().entries.contains_key(key) {
            self.append_frame(OP_DELETE, key, &[])?;
        }
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.inner.lock().entries.keys().cloned().collect())
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

/// Encodes a single frame: opcode, key length, value length, key, value,
/// trailing CRC-32 over everything before it.
fn encode_frame(op: u8, key: &str, value: &[u8]) -> StorageResult<Vec<u8>> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() > MAX_KEY_LEN {
        return Err(StorageError::KeyTooLarge {
            len: key_bytes.len(),
            max: MAX_KEY_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + key_bytes.len() + value.len() + CRC_LEN);
    frame.push(op);
    frame.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(value.len() as u32).to_le_bytes());
    frame.extend_from_slice(key_bytes);
    frame.extend_from_slice(value);
    let crc = crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Replays the log, returning the rebuilt entries, the byte offset of the
/// last valid frame end, and the number of frames read.
fn replay(
    file: &mut File,
    path: &Path,
) -> StorageResult<(BTreeMap<String, Vec<u8>>, u64, u64)> {
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut data)?;

    let mut entries = BTreeMap::new();
    let mut offset = 0usize;
    let mut frames = 0u64;

    while offset < data.len() {
        match decode_frame(&data[offset..]) {
            Some((op, key, value, frame_len)) => {
                match op {
                    OP_PUT => {
                        entries.insert(key, value);
                    }
                    OP_DELETE => {
                        entries.remove(&key);
                    }
                    _ => {
                        warn!(
                            path = %path.display(),
                            offset,
                            opcode = op,
                            "unknown frame opcode, truncating log tail"
                        );
                        break;
                    }
                }
                offset += frame_len;
                frames += 1;
            }
            None => {
                warn!(
                    path = %path.display(),
                    offset,
                    trailing = data.len() - offset,
                    "corrupt or torn frame, truncating log tail"
                );
                break;
            }
        }
    }

    Ok((entries, offset as u64, frames))
}

/// Decodes one frame from the front of `data`.
///
/// Returns `None` if the frame is incomplete or fails its checksum.
fn decode_frame(data: &[u8]) -> Option<(u8, String, Vec<u8>, usize)> {
    if data.len() < HEADER_LEN + CRC_LEN {
        return None;
    }

    let op = data[0];
    let key_len = u32::from_le_bytes(data[1..5].try_into().ok()?) as usize;
    let val_len = u32::from_le_bytes(data[5..9].try_into().ok()?) as usize;

    if key_len > MAX_KEY_LEN {
        return None;
    }
    let frame_len = HEADER_LEN + key_len + val_len + CRC_LEN;
    if data.len() < frame_len {
        return None;
    }

    let body_end = HEADER_LEN + key_len + val_len;
    let stored_crc = u32::from_le_bytes(data[body_end..body_end + CRC_LEN].try_into().ok()?);
    if crc32(&data[..body_end]) != stored_crc {
        return None;
    }

    let key = String::from_utf8(data[HEADER_LEN..HEADER_LEN + key_len].to_vec()).ok()?;
    let value = data[HEADER_LEN + key_len..body_end].to_vec();

    Some((op, key, value, frame_len))
}

/// CRC-32 (IEEE polynomial), bitwise implementation.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn file_log_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let backend = FileLogBackend::open(&path).unwrap();
        assert!(backend.keys().unwrap().is_empty());
        assert!(path.exists());
    }

    #[test]
    fn file_log_put_get_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let backend = FileLogBackend::open(&path).unwrap();
        backend.put("a", b"1").unwrap();
        backend.put("b", b"2").unwrap();

        assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));

        backend.delete("a").unwrap();
        assert_eq!(backend.get("a").unwrap(), None);
        assert_eq!(backend.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn file_log_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let backend = FileLogBackend::open(&path).unwrap();
            backend.put("survives", b"restart").unwrap();
            backend.put("deleted", b"gone").unwrap();
            backend.delete("deleted").unwrap();
            backend.flush().unwrap();
        }

        {
            let backend = FileLogBackend::open(&path).unwrap();
            assert_eq!(backend.get("survives").unwrap(), Some(b"restart".to_vec()));
            assert_eq!(backend.get("deleted").unwrap(), None);
        }
    }

    #[test]
    fn file_log_overwrite_keeps_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let backend = FileLogBackend::open(&path).unwrap();
            backend.put("k", b"first").unwrap();
            backend.put("k", b"second").unwrap();
        }

        let backend = FileLogBackend::open(&path).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn file_log_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let backend = FileLogBackend::open(&path).unwrap();
            backend.put("good", b"frame").unwrap();
            backend.flush().unwrap();
        }

        // Simulate a crash mid-append: garbage at the tail.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[OP_PUT, 0xFF, 0xFF]).unwrap();
            file.sync_all().unwrap();
        }

        let backend = FileLogBackend::open(&path).unwrap();
        assert_eq!(backend.get("good").unwrap(), Some(b"frame".to_vec()));
        assert_eq!(backend.keys().unwrap().len(), 1);

        // The truncated log accepts further writes
        backend.put("after", b"recovery").unwrap();
        let reopened = FileLogBackend::open(&path).unwrap();
        assert_eq!(reopened.get("after").unwrap(), Some(b"recovery".to_vec()));
    }

    #[test]
    fn file_log_corrupt_checksum_drops_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let backend = FileLogBackend::open(&path).unwrap();
            backend.put("first", b"ok").unwrap();
            backend.put("second", b"damaged").unwrap();
            backend.flush().unwrap();
        }

        // Flip a byte inside the second frame's value.
        {
            let data = std::fs::read(&path).unwrap();
            let mut mutated = data.clone();
            let idx = mutated.len() - CRC_LEN - 1;
            mutated[idx] ^= 0xFF;
            std::fs::write(&path, &mutated).unwrap();
        }

        let backend = FileLogBackend::open(&path).unwrap();
        assert_eq!(backend.get("first").unwrap(), Some(b"ok".to_vec()));
        assert_eq!(backend.get("second").unwrap(), None);
    }

    #[test]
    fn file_log_compact_shrinks_and_preserves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let backend = FileLogBackend::open(&path).unwrap();
        for i in 0..20 {
            backend.put("churn", format!("v{i}").as_bytes()).unwrap();
        }
        backend.put("keep", b"me").unwrap();
        backend.delete("churn").unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        backend.compact().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();

        assert!(after < before);
        assert_eq!(backend.get("keep").unwrap(), Some(b"me".to_vec()));
        assert_eq!(backend.get("churn").unwrap(), None);

        // Compacted log replays correctly
        drop(backend);
        let reopened = FileLogBackend::open(&path).unwrap();
        assert_eq!(reopened.get("keep").unwrap(), Some(b"me".to_vec()));
    }

    #[test]
    fn file_log_key_too_large() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let backend = FileLogBackend::open(&path).unwrap();
        let huge = "x".repeat(MAX_KEY_LEN + 1);
        let result = backend.put(&huge, b"v");
        assert!(matches!(result, Err(StorageError::KeyTooLarge { .. })));
    }

    #[test]
    fn file_log_delete_missing_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let backend = FileLogBackend::open(&path).unwrap();
        backend.delete("never-existed").unwrap();
        assert_eq!(backend.frames_written(), 0);
    }

    proptest! {
        #[test]
        fn frame_roundtrip(key in "[a-z0-9:_-]{1,64}", value in proptest::collection::vec(any::<u8>(), 0..512)) {
            let frame = encode_frame(OP_PUT, &key, &value).unwrap();
            let (op, k, v, len) = decode_frame(&frame).unwrap();
            prop_assert_eq!(op, OP_PUT);
            prop_assert_eq!(k, key);
            prop_assert_eq!(v, value);
            prop_assert_eq!(len, frame.len());
        }

        #[test]
        fn truncated_frame_never_decodes(key in "[a-z]{1,16}", value in proptest::collection::vec(any::<u8>(), 1..64), cut in 1usize..8) {
            let frame = encode_frame(OP_PUT, &key, &value).unwrap();
            let cut = cut.min(frame.len() - 1);
            let truncated = &frame[..frame.len() - cut];
            prop_assert!(decode_frame(truncated).is_none());
        }
    }
}
