use crate::config::{ManagerConfig, StorageKind};
use crate::engine::{EngineFactory, TransferContext, TransferEngine, TransferError};
use crate::integrity::sha256_storage;
use crate::request::RequestSpec;
use crate::storage::{FileStorage, MemoryStorage, Storage};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Suffix of the partial file used by [`StorageKind::File`].
pub const PART_SUFFIX: &str = ".odm-part";

/// Returns the path for the temporary download file.
/// e.g., for "/path/to/file.zip", it returns "/path/to/file.zip.odm-part"
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(PART_SUFFIX);
    PathBuf::from(path)
}

/// Single-stream HTTP engine. Resumes from whatever its storage already holds
/// by asking for `bytes=<len>-`.
pub struct HttpEngine {
    client: Client,
    storage: Box<dyn Storage>,
}

impl HttpEngine {
    pub fn new(client: Client, storage: Box<dyn Storage>) -> Self {
        Self { client, storage }
    }

    async fn send(&self, url: &str, resume_from: u64) -> Result<Response, TransferError> {
        let mut request = self.client.get(url);
        if resume_from > 0 {
            tracing::debug!(url, resume_from, "requesting remaining range");
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        }
        Ok(request.send().await?)
    }

    /// Sends the request, falling back to a full download when the server
    /// refuses or ignores the range.
    async fn open_stream(&mut self, url: &str) -> Result<Response, TransferError> {
        let resume_from = self.storage.length();
        let mut resp = self.send(url, resume_from).await?;

        if resume_from > 0 && resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            tracing::warn!(url, "range not satisfiable, restarting from zero");
            self.storage.clear().await?;
            resp = self.send(url, 0).await?;
        }
        let resp = resp.error_for_status()?;

        if resume_from > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
            tracing::warn!(url, status = %resp.status(), "server ignored range, restarting from zero");
            self.storage.clear().await?;
        }
        Ok(resp)
    }

    async fn write_destination(&self, destination: &Path) -> Result<(), TransferError> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut reader = self.storage.open_reader().await?;
        let mut file = tokio::fs::File::create(destination).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl TransferEngine for HttpEngine {
    async fn transfer(&mut self, ctx: TransferContext) -> Result<(), TransferError> {
        ctx.reporter.started();

        let resp = tokio::select! {
            resp = self.open_stream(&ctx.target) => resp?,
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let total = resp.content_length().map(|len| len + self.storage.length());
        let mut downloaded = self.storage.length();
        let mut stream = resp.bytes_stream();

        loop {
            let chunk = tokio::select! {
                next = stream.next() => match next {
                    Some(chunk) => chunk?,
                    None => break,
                },
                _ = ctx.cancel.cancelled() => {
                    self.storage.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            };
            self.storage.append(&chunk, 0, chunk.len()).await?;
            downloaded += chunk.len() as u64;
            ctx.reporter.progress(downloaded, total);
        }
        self.storage.flush().await?;

        if let Some(expected) = ctx.sha256.as_deref() {
            let actual = sha256_storage(&*self.storage).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                // A corrupt payload must not be resumed from.
                self.storage.clear().await?;
                return Err(TransferError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        self.write_destination(&ctx.destination).await?;
        tracing::info!(url = %ctx.target, bytes = downloaded, destination = %ctx.destination.display(), "transfer finished");
        Ok(())
    }

    fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    fn storage_mut(&mut self) -> &mut dyn Storage {
        &mut *self.storage
    }
}

/// Creates an [`HttpEngine`] per request, sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct HttpEngineFactory {
    client: Client,
    storage: StorageKind,
}

impl HttpEngineFactory {
    pub fn new(client: Client, storage: StorageKind) -> Self {
        Self { client, storage }
    }

    pub fn from_config(config: &ManagerConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(client, config.storage))
    }
}

#[async_trait]
impl EngineFactory for HttpEngineFactory {
    async fn create(&self, spec: &RequestSpec) -> Result<Box<dyn TransferEngine>, TransferError> {
        let storage: Box<dyn Storage> = match self.storage {
            StorageKind::Memory => Box::new(MemoryStorage::new()),
            StorageKind::File => {
                Box::new(FileStorage::open(temporary_path(&spec.destination)).await?)
            }
        };
        Ok(Box::new(HttpEngine::new(self.client.clone(), storage)))
    }
}
