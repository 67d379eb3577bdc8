// src/storage.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Version written into every [`StorageSnapshot`] produced by this crate.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("range {offset}+{count} is outside a buffer of {len} bytes")]
    OutOfRange { offset: usize, count: usize, len: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt snapshot: declared {declared} bytes, found {actual}")]
    CorruptSnapshot { declared: u64, actual: u64 },
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Forward-only view over the content of a storage at the time it was opened.
pub type StorageReader = Box<dyn AsyncRead + Send + Unpin>;

/// An append-only byte buffer that a transfer engine streams into.
///
/// The write cursor always equals [`Storage::length`]; bytes are never written at
/// an arbitrary offset. A storage restored from a [`StorageSnapshot`] continues
/// appending exactly where the snapshot was taken.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Appends `bytes[offset..offset + count]` to the end of the stored sequence.
    ///
    /// Once this resolves, [`Storage::length`] includes the new bytes and a newly
    /// opened reader observes them. If the future is dropped before it resolves,
    /// the length is unchanged and the next append starts at that length.
    async fn append(&mut self, bytes: &[u8], offset: usize, count: usize)
        -> Result<(), StorageError>;

    /// Opens a reader over bytes `0..length()`.
    async fn open_reader(&self) -> Result<StorageReader, StorageError>;

    /// Current number of stored bytes.
    fn length(&self) -> u64;

    /// Discards all content.
    async fn clear(&mut self) -> Result<(), StorageError>;

    /// Forces buffered bytes to the backing medium. Never changes the length.
    async fn flush(&mut self) -> Result<(), StorageError>;

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError>;

    /// Replaces the current content with the snapshot's content.
    async fn restore(&mut self, snapshot: &StorageSnapshot) -> Result<(), StorageError>;

    /// Whether the content outlives the process without a snapshot.
    fn is_durable(&self) -> bool {
        false
    }
}

/// Validates the caller's slice bounds for an append.
fn source_range(len: usize, offset: usize, count: usize) -> Result<Range<usize>, StorageError> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(StorageError::OutOfRange { offset, count, len }),
    }
}

/// Portable, versioned image of a storage's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub format_version: u32,
    pub length: u64,
    #[serde(with = "base64_content")]
    pub content: Vec<u8>,
}

impl StorageSnapshot {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            length: content.len() as u64,
            content,
        }
    }

    /// Checks the version tag and that the declared length matches the content.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(self.format_version));
        }
        let actual = self.content.len() as u64;
        if actual != self.length {
            return Err(StorageError::CorruptSnapshot {
                declared: self.length,
                actual,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let snapshot: StorageSnapshot = serde_json::from_slice(bytes)?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

mod base64_content {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Storage backed by a growable in-memory buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append(
        &mut self,
        bytes: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<(), StorageError> {
        let range = source_range(bytes.len(), offset, count)?;
        self.data.extend_from_slice(&bytes[range]);
        Ok(())
    }

    async fn open_reader(&self) -> Result<StorageReader, StorageError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        Ok(StorageSnapshot::new(self.data.clone()))
    }

    async fn restore(&mut self, snapshot: &StorageSnapshot) -> Result<(), StorageError> {
        snapshot.validate()?;
        self.data = snapshot.content.clone();
        Ok(())
    }
}

/// Storage backed by a file on disk. Survives process restarts on its own.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: File,
    length: u64,
    /// Set while an append is in flight. Still set afterwards means the append
    /// was dropped and the file may hold bytes past `length`.
    dirty: bool,
}

impl FileStorage {
    /// Opens (or creates) the backing file and positions the cursor at its end,
    /// so a partially written file resumes where it stopped.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        let length = file.seek(SeekFrom::End(0)).await?;
        Ok(Self {
            path,
            file,
            length,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn truncate(&mut self) -> Result<(), StorageError> {
        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.length = 0;
        self.dirty = false;
        Ok(())
    }

    /// Cuts off whatever an abandoned append left behind `length` and puts the
    /// cursor back at `length`.
    async fn settle(&mut self) -> Result<(), StorageError> {
        if self.dirty {
            tracing::debug!(path = %self.path.display(), length = self.length, "discarding bytes of an abandoned append");
            self.file.set_len(self.length).await?;
            self.file.seek(SeekFrom::Start(self.length)).await?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn append(
        &mut self,
        bytes: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<(), StorageError> {
        let range = source_range(bytes.len(), offset, count)?;
        self.settle().await?;
        self.dirty = true;
        self.file.write_all(&bytes[range]).await?;
        // Hand the bytes to the OS so independent read handles see them.
        self.file.flush().await?;
        self.length += count as u64;
        self.dirty = false;
        Ok(())
    }

    async fn open_reader(&self) -> Result<StorageReader, StorageError> {
        let file = File::open(&self.path).await?;
        Ok(Box::new(file.take(self.length)))
    }

    fn length(&self) -> u64 {
        self.length
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        self.truncate().await
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        self.settle().await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        let mut content = Vec::with_capacity(self.length as usize);
        self.open_reader().await?.read_to_end(&mut content).await?;
        let snapshot = StorageSnapshot::new(content);
        if snapshot.length != self.length {
            return Err(StorageError::CorruptSnapshot {
                declared: self.length,
                actual: snapshot.length,
            });
        }
        Ok(snapshot)
    }

    async fn restore(&mut self, snapshot: &StorageSnapshot) -> Result<(), StorageError> {
        snapshot.validate()?;
        self.truncate().await?;
        self.dirty = true;
        self.file.write_all(&snapshot.content).await?;
        self.file.flush().await?;
        self.length = snapshot.length;
        self.dirty = false;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// Reads the full content of a storage into memory.
pub async fn read_all(storage: &dyn Storage) -> Result<Vec<u8>, StorageError> {
    let mut content = Vec::with_capacity(storage.length() as usize);
    storage.open_reader().await?.read_to_end(&mut content).await?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    const DATA_LENGTH: usize = 2048;

    fn dummy_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 3)) as u8).collect()
    }

    async fn check_append_and_read(storage: &mut dyn Storage) {
        let data = dummy_data(DATA_LENGTH);
        storage.append(&data, 0, DATA_LENGTH / 2).await.unwrap();
        storage.flush().await.unwrap();

        assert_eq!(storage.length(), (DATA_LENGTH / 2) as u64);
        assert_eq!(read_all(storage).await.unwrap(), &data[..DATA_LENGTH / 2]);
    }

    async fn check_many_small_appends(storage: &mut dyn Storage) {
        let data = dummy_data(DATA_LENGTH);
        let count = 128;
        let chunk = DATA_LENGTH / count;
        for i in 0..count {
            storage.append(&data, chunk * i, chunk).await.unwrap();
        }

        assert_eq!(storage.length(), DATA_LENGTH as u64);
        assert_eq!(read_all(storage).await.unwrap(), data);
    }

    async fn check_out_of_range(storage: &mut dyn Storage) {
        let data = dummy_data(DATA_LENGTH);
        storage.append(&data, 0, 10).await.unwrap();

        let err = storage.append(&data, 1, DATA_LENGTH).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { offset: 1, .. }));
        let err = storage.append(&data, usize::MAX, 2).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { .. }));
        assert_eq!(storage.length(), 10);
    }

    async fn check_clear(storage: &mut dyn Storage) {
        let data = dummy_data(DATA_LENGTH);
        storage.append(&data, 0, DATA_LENGTH).await.unwrap();
        storage.clear().await.unwrap();
        assert_eq!(storage.length(), 0);

        storage.append(&data, 5, 3).await.unwrap();
        assert_eq!(read_all(storage).await.unwrap(), &data[5..8]);
    }

    async fn check_resume_after_restore(storage: &mut dyn Storage, fresh: &mut dyn Storage) {
        let data = [0x0u8, 0x1, 0x2, 0x3, 0x4];
        storage.append(&data, 0, data.len()).await.unwrap();
        storage.flush().await.unwrap();

        let encoded = storage.snapshot().await.unwrap().encode().unwrap();
        let snapshot = StorageSnapshot::decode(&encoded).unwrap();
        fresh.restore(&snapshot).await.unwrap();
        fresh.append(&data, 0, data.len()).await.unwrap();

        assert_eq!(fresh.length(), (data.len() * 2) as u64);
        let content = read_all(fresh).await.unwrap();
        assert_eq!(&content[..data.len()], &data);
        assert_eq!(&content[data.len()..], &data);
    }

    #[tokio::test]
    async fn memory_append_and_read() {
        check_append_and_read(&mut MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn memory_many_small_appends() {
        check_many_small_appends(&mut MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn memory_out_of_range() {
        check_out_of_range(&mut MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn memory_clear() {
        check_clear(&mut MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn memory_resume_after_restore() {
        check_resume_after_restore(&mut MemoryStorage::new(), &mut MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn file_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("a.part")).await.unwrap();
        check_append_and_read(&mut storage).await;
    }

    #[tokio::test]
    async fn file_many_small_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("a.part")).await.unwrap();
        check_many_small_appends(&mut storage).await;
    }

    #[tokio::test]
    async fn file_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("a.part")).await.unwrap();
        check_out_of_range(&mut storage).await;
    }

    #[tokio::test]
    async fn file_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("a.part")).await.unwrap();
        check_clear(&mut storage).await;
    }

    #[tokio::test]
    async fn file_resume_after_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("a.part")).await.unwrap();
        let mut fresh = FileStorage::open(dir.path().join("b.part")).await.unwrap();
        check_resume_after_restore(&mut storage, &mut fresh).await;
    }

    #[tokio::test]
    async fn snapshot_restores_across_variants() {
        let dir = tempfile::tempdir().unwrap();
        let data = dummy_data(300);
        let mut memory = MemoryStorage::new();
        memory.append(&data, 0, data.len()).await.unwrap();

        let mut file = FileStorage::open(dir.path().join("x.part")).await.unwrap();
        file.restore(&memory.snapshot().await.unwrap()).await.unwrap();
        assert_eq!(read_all(&file).await.unwrap(), data);
    }

    /// Drops an append after its first poll, then resumes from whatever
    /// `length()` reports. The content must match the source exactly.
    async fn check_abandoned_append_then_resume(storage: &mut dyn Storage) -> Vec<u8> {
        let source = dummy_data(96);
        storage.append(&source, 0, 32).await.unwrap();
        let _ = storage.append(&source, 32, 32).now_or_never();

        let resume_from = storage.length() as usize;
        assert!(resume_from == 32 || resume_from == 64);
        storage
            .append(&source, resume_from, source.len() - resume_from)
            .await
            .unwrap();
        storage.flush().await.unwrap();
        assert_eq!(storage.length(), 96);
        assert_eq!(read_all(storage).await.unwrap(), source);
        source
    }

    #[tokio::test]
    async fn memory_abandoned_append_then_resume() {
        check_abandoned_append_then_resume(&mut MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn file_abandoned_append_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abandoned.part");
        let source = {
            let mut storage = FileStorage::open(&path).await.unwrap();
            check_abandoned_append_then_resume(&mut storage).await
        };

        assert_eq!(std::fs::read(&path).unwrap(), source);
        assert_eq!(FileStorage::open(&path).await.unwrap().length(), 96);
    }

    #[tokio::test]
    async fn file_storage_reopens_at_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.part");
        let data = dummy_data(64);
        {
            let mut storage = FileStorage::open(&path).await.unwrap();
            storage.append(&data, 0, 40).await.unwrap();
            storage.flush().await.unwrap();
        }

        let mut storage = FileStorage::open(&path).await.unwrap();
        assert_eq!(storage.length(), 40);
        storage.append(&data, 40, 24).await.unwrap();
        assert_eq!(read_all(&storage).await.unwrap(), data);
    }

    #[test]
    fn decode_rejects_unknown_version_and_bad_length() {
        let mut snapshot = StorageSnapshot::new(vec![1, 2, 3]);
        snapshot.format_version = 99;
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        assert!(matches!(
            StorageSnapshot::decode(&bytes),
            Err(StorageError::UnsupportedVersion(99))
        ));

        let mut snapshot = StorageSnapshot::new(vec![1, 2, 3]);
        snapshot.length = 7;
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        assert!(matches!(
            StorageSnapshot::decode(&bytes),
            Err(StorageError::CorruptSnapshot { declared: 7, actual: 3 })
        ));
    }
}
