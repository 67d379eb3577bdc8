// src/request.rs

use crate::engine::TransferEngine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::{watch, Mutex};

/// What a caller asks for: fetch `target` into `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub target: String,
    pub destination: PathBuf,
    /// Optional hex SHA-256 the finished content must match.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl RequestSpec {
    pub fn new(target: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            destination: destination.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, checksum: impl Into<String>) -> Self {
        self.sha256 = Some(checksum.into());
        self
    }
}

/// Lifecycle of a request inside the scheduler.
///
/// `Idle -> Queued -> Active -> Complete`, with `Active -> Idle` on failure and
/// `Queued | Active -> Cancelled` on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Idle,
    Queued,
    Active,
    Complete,
    Cancelled,
}

impl RequestState {
    /// Waiting for, or holding, an admission slot.
    pub fn is_pending(self) -> bool {
        matches!(self, RequestState::Queued | RequestState::Active)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Idle => "idle",
            RequestState::Queued => "queued",
            RequestState::Active => "active",
            RequestState::Complete => "complete",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub state: RequestState,
    pub last_error: Option<String>,
}

/// Persistent form of a request, stored alongside its storage snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub spec: RequestSpec,
    pub status: RequestStatus,
}

/// A registered download. Owns exactly one transfer engine and, through it,
/// one storage.
///
/// The status is only mutated by the download manager while it holds its
/// scheduling lock; everyone else observes it.
pub struct Request {
    spec: RequestSpec,
    status: watch::Sender<RequestStatus>,
    pub(crate) engine: Mutex<Box<dyn TransferEngine>>,
}

impl Request {
    pub(crate) fn new(spec: RequestSpec, engine: Box<dyn TransferEngine>) -> Self {
        let (status, _) = watch::channel(RequestStatus {
            state: RequestState::Idle,
            last_error: None,
        });
        Self {
            spec,
            status,
            engine: Mutex::new(engine),
        }
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    pub fn target(&self) -> &str {
        &self.spec.target
    }

    pub fn destination(&self) -> &Path {
        &self.spec.destination
    }

    pub fn state(&self) -> RequestState {
        self.status.borrow().state
    }

    pub fn status(&self) -> RequestStatus {
        self.status.borrow().clone()
    }

    /// Admitted (or waiting to be admitted) for transfer and not yet finished.
    pub fn is_queued(&self) -> bool {
        self.state().is_pending()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == RequestState::Complete
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    pub fn record(&self) -> RequestRecord {
        RequestRecord {
            spec: self.spec.clone(),
            status: self.status(),
        }
    }

    /// Resolves once the request is neither queued nor active, returning the
    /// state it settled in.
    pub async fn wait(&self) -> RequestState {
        let mut rx = self.status.subscribe();
        let settled = match rx.wait_for(|status| !status.state.is_pending()).await {
            Ok(status) => status.state,
            Err(_) => self.state(),
        };
        settled
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.status.send_modify(|status| status.state = state);
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn fail(&self, error: String) {
        self.status.send_modify(|status| {
            status.state = RequestState::Idle;
            status.last_error = Some(error);
        });
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("spec", &self.spec)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}
