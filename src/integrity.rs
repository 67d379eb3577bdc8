
use crate::storage::{Storage, StorageError, StorageReader};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Compute the hex SHA256 of everything a reader yields.
pub async fn sha256_reader(mut reader: StorageReader) -> Result<String, IntegrityError> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the hex SHA256 of a storage's current content.
pub async fn sha256_storage(storage: &dyn Storage) -> Result<String, IntegrityError> {
    let reader = storage.open_reader().await?;
    sha256_reader(reader).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn digest_of_known_content() {
        let mut storage = MemoryStorage::new();
        storage.append(b"abc", 0, 3).await.unwrap();
        assert_eq!(
            sha256_storage(&storage).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn digest_of_empty_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(
            sha256_storage(&storage).await.unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
