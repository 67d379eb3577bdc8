// src/engine.rs

use crate::events::{DownloadEvent, EventHub};
use crate::integrity::IntegrityError;
use crate::request::RequestSpec;
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors a transfer engine reports through its completion.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

/// Lets an engine announce `started` and `progress` for the request it serves.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    target: String,
    hub: EventHub,
}

impl ProgressReporter {
    pub fn new(target: impl Into<String>, hub: EventHub) -> Self {
        Self {
            target: target.into(),
            hub,
        }
    }

    pub fn started(&self) {
        self.hub.publish(DownloadEvent::Started {
            target: self.target.clone(),
        });
    }

    pub fn progress(&self, downloaded: u64, total: Option<u64>) {
        self.hub.publish(DownloadEvent::Progress {
            target: self.target.clone(),
            downloaded,
            total,
        });
    }
}

/// Everything an engine needs for one run.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub target: String,
    pub destination: PathBuf,
    pub sha256: Option<String>,
    pub reporter: ProgressReporter,
    /// Cancelled when the scheduler wants this run to stop.
    pub cancel: CancellationToken,
}

/// Performs the network transfer for a single request, streaming bytes into
/// the storage it owns.
///
/// Returning `Err(TransferError::Cancelled)` or observing `ctx.cancel` is how an
/// engine cooperates with cancellation. The scheduler also drops the running
/// future once the token fires, so engines must leave their storage consistent
/// at every `.await`.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn transfer(&mut self, ctx: TransferContext) -> Result<(), TransferError>;

    fn storage(&self) -> &dyn Storage;

    fn storage_mut(&mut self) -> &mut dyn Storage;
}

/// Builds one engine (and one storage) per registered request.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, spec: &RequestSpec) -> Result<Box<dyn TransferEngine>, TransferError>;
}
