#![allow(dead_code)]

use async_trait::async_trait;
use odm::downloader::temporary_path;
use odm::engine::{EngineFactory, TransferContext, TransferEngine, TransferError};
use odm::events::DownloadEvent;
use odm::request::RequestSpec;
use odm::storage::{FileStorage, MemoryStorage, Storage};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Shared knobs and counters for every engine a [`MockFactory`] creates.
#[derive(Default)]
pub struct MockBehavior {
    pub payload: Vec<u8>,
    /// Total time one full transfer takes.
    pub delay: Duration,
    pub fail_targets: HashSet<String>,
    /// The next run fails after writing half of the payload.
    pub fail_once_halfway: AtomicBool,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub runs: AtomicUsize,
}

impl MockBehavior {
    pub fn new(payload_len: usize, delay: Duration) -> Self {
        Self {
            payload: (0..payload_len).map(|i| (i % 251) as u8).collect(),
            delay,
            ..Default::default()
        }
    }
}

struct RunningGuard(Arc<MockBehavior>);

impl RunningGuard {
    fn enter(behavior: Arc<MockBehavior>) -> Self {
        let now = behavior.running.fetch_add(1, Ordering::SeqCst) + 1;
        behavior.max_running.fetch_max(now, Ordering::SeqCst);
        behavior.runs.fetch_add(1, Ordering::SeqCst);
        Self(behavior)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockEngine {
    storage: Box<dyn Storage>,
    behavior: Arc<MockBehavior>,
}

#[async_trait]
impl TransferEngine for MockEngine {
    async fn transfer(&mut self, ctx: TransferContext) -> Result<(), TransferError> {
        ctx.reporter.started();
        let _guard = RunningGuard::enter(self.behavior.clone());

        let payload = &self.behavior.payload;
        let total = payload.len();
        let fail_halfway = self.behavior.fail_once_halfway.swap(false, Ordering::SeqCst);
        let stop_at = if fail_halfway { total / 2 } else { total };
        let chunks = 4u32;
        let chunk_len = (total / chunks as usize).max(1);

        while (self.storage.length() as usize) < stop_at {
            tokio::select! {
                _ = tokio::time::sleep(self.behavior.delay / chunks) => {}
                _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            }
            let start = self.storage.length() as usize;
            let count = chunk_len.min(stop_at - start);
            self.storage.append(payload, start, count).await?;
            ctx.reporter
                .progress(self.storage.length(), Some(total as u64));
        }

        if self.behavior.delay.is_zero() {
            tokio::task::yield_now().await;
        }
        if fail_halfway {
            return Err(TransferError::Other("connection reset".to_string()));
        }
        if self.behavior.fail_targets.contains(&ctx.target) {
            return Err(TransferError::Other("simulated failure".to_string()));
        }
        Ok(())
    }

    fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    fn storage_mut(&mut self) -> &mut dyn Storage {
        &mut *self.storage
    }
}

pub struct MockFactory {
    pub behavior: Arc<MockBehavior>,
    /// Engines store into a part file next to the destination.
    file_storage: bool,
}

impl MockFactory {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::new(behavior),
            file_storage: false,
        })
    }

    pub fn with_file_storage(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::new(behavior),
            file_storage: true,
        })
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    async fn create(&self, spec: &RequestSpec) -> Result<Box<dyn TransferEngine>, TransferError> {
        let storage: Box<dyn Storage> = if self.file_storage {
            Box::new(FileStorage::open(temporary_path(&spec.destination)).await?)
        } else {
            Box::new(MemoryStorage::new())
        };
        Ok(Box::new(MockEngine {
            storage,
            behavior: self.behavior.clone(),
        }))
    }
}

pub fn spec(dir: &Path, name: &str) -> RequestSpec {
    RequestSpec::new(format!("http://example.com/{name}"), dir.join(name))
}

/// Everything currently buffered on the receiver.
pub fn drain(rx: &mut broadcast::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Receives until `count` events match `pred`, failing the test after two seconds.
pub async fn expect_events<F>(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    count: usize,
    pred: F,
) -> Vec<DownloadEvent>
where
    F: Fn(&DownloadEvent) -> bool,
{
    let mut matched = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        while matched.len() < count {
            let event = rx.recv().await.expect("event channel closed or lagged");
            if pred(&event) {
                matched.push(event);
            }
        }
    })
    .await
    .expect("timed out waiting for events");
    matched
}

pub fn is_completed(event: &DownloadEvent) -> bool {
    matches!(event, DownloadEvent::Completed { .. })
}

pub fn is_added(event: &DownloadEvent) -> bool {
    matches!(event, DownloadEvent::Added { .. })
}
