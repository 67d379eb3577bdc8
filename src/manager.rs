// src/manager.rs

use crate::config::ManagerConfig;
use crate::downloader::HttpEngineFactory;
use crate::engine::{EngineFactory, ProgressReporter, TransferContext, TransferError};
use crate::events::{DownloadEvent, EventHub};
use crate::request::{Request, RequestSpec, RequestState, RequestStatus};
use crate::state_manager::{StateError, StateManager};
use crate::storage::{StorageError, StorageSnapshot};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request for {0} not found")]
    NotFound(String),
    #[error("request for {target} cannot be cancelled while {state}")]
    NotCancellable { target: String, state: RequestState },
    #[error("request for {target} cannot be resumed while {state}")]
    NotResumable { target: String, state: RequestState },
    #[error("request for {0} is queued or transferring")]
    Busy(String),
    #[error("engine error: {0}")]
    Engine(#[from] TransferError),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How a single engine run ended.
#[derive(Debug)]
enum TransferOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

struct Entry {
    request: Arc<Request>,
    /// Present while the request holds an admission slot.
    cancel: Option<CancellationToken>,
}

/// Requests keyed by target, iterated in insertion order.
#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Registry {
    fn get(&self, target: &str) -> Option<&Arc<Request>> {
        self.index.get(target).map(|&i| &self.entries[i].request)
    }

    fn entry_mut(&mut self, target: &str) -> Option<&mut Entry> {
        let i = *self.index.get(target)?;
        self.entries.get_mut(i)
    }

    fn insert(&mut self, request: Arc<Request>) {
        self.index
            .insert(request.target().to_string(), self.entries.len());
        self.entries.push(Entry {
            request,
            cancel: None,
        });
    }

    /// First queued, not yet complete request in scan order.
    fn next_queued(&mut self) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.request.state() == RequestState::Queued)
    }

    fn requests(&self) -> Vec<Arc<Request>> {
        self.entries.iter().map(|e| e.request.clone()).collect()
    }

    fn remove(&mut self, target: &str) -> Option<Entry> {
        let removed = self.index.remove(target)?;
        let entry = self.entries.remove(removed);
        for (i, later) in self.entries.iter().enumerate().skip(removed) {
            self.index.insert(later.request.target().to_string(), i);
        }
        Some(entry)
    }

    fn take(&mut self) -> Vec<Entry> {
        self.index.clear();
        std::mem::take(&mut self.entries)
    }
}

/// Everything guarded by the scheduling lock.
struct Scheduler {
    registry: Registry,
    ceiling: usize,
}

/// Owns the registry of requests, caps how many transfer at once, and admits
/// queued requests as slots free up.
///
/// Registry mutation, slot accounting and request state changes all happen
/// under one lock that is never held across network or disk I/O. Transfers are
/// spawned onto the runtime and report back through a shared completion path.
/// Persistence runs after that lock is released.
pub struct DownloadManager {
    factory: Arc<dyn EngineFactory>,
    events: EventHub,
    state_manager: Option<StateManager>,
    scheduler: Mutex<Scheduler>,
    /// Mutated only while `scheduler` is locked; readable without it.
    active: AtomicUsize,
    /// Orders saves so the last write always carries the latest status.
    persist_lock: Mutex<()>,
}

impl DownloadManager {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        max_concurrent_downloads: usize,
    ) -> Result<Arc<Self>, ManagerError> {
        Self::build(factory, max_concurrent_downloads, DEFAULT_EVENT_CAPACITY, None)
    }

    /// Creates a manager that persists request records and storage snapshots,
    /// and reloads whatever the state manager already holds.
    ///
    /// Requests that were queued or active when last saved come back `Idle`;
    /// call [`DownloadManager::resume`] to continue them.
    pub async fn with_state_manager(
        factory: Arc<dyn EngineFactory>,
        max_concurrent_downloads: usize,
        event_capacity: usize,
        state_manager: StateManager,
    ) -> Result<Arc<Self>, ManagerError> {
        let manager = Self::build(
            factory,
            max_concurrent_downloads,
            event_capacity,
            Some(state_manager.clone()),
        )?;
        manager.load_requests(&state_manager).await?;
        Ok(manager)
    }

    /// HTTP-backed manager built from configuration.
    pub async fn from_config(config: &ManagerConfig) -> Result<Arc<Self>, ManagerError> {
        let factory: Arc<dyn EngineFactory> = Arc::new(HttpEngineFactory::from_config(config)?);
        match &config.state_db {
            Some(path) => {
                let state_manager = StateManager::new(path).await?;
                Self::with_state_manager(
                    factory,
                    config.max_concurrent_downloads,
                    config.event_capacity,
                    state_manager,
                )
                .await
            }
            None => Self::build(
                factory,
                config.max_concurrent_downloads,
                config.event_capacity,
                None,
            ),
        }
    }

    fn build(
        factory: Arc<dyn EngineFactory>,
        max_concurrent_downloads: usize,
        event_capacity: usize,
        state_manager: Option<StateManager>,
    ) -> Result<Arc<Self>, ManagerError> {
        check_ceiling(max_concurrent_downloads)?;
        Ok(Arc::new(Self {
            factory,
            events: EventHub::new(event_capacity),
            state_manager,
            scheduler: Mutex::new(Scheduler {
                registry: Registry::default(),
                ceiling: max_concurrent_downloads,
            }),
            active: AtomicUsize::new(0),
            persist_lock: Mutex::new(()),
        }))
    }

    async fn load_requests(&self, state_manager: &StateManager) -> Result<(), ManagerError> {
        let stored = state_manager.load_all().await?;
        let loaded = stored.len();
        for stored in stored {
            let spec = stored.record.spec;
            let mut engine = self.factory.create(&spec).await?;
            if let Some(snapshot) = &stored.snapshot {
                engine.storage_mut().restore(snapshot).await?;
            }
            let mut status = stored.record.status;
            if status.state.is_pending() {
                status.state = RequestState::Idle;
            }

            let request = Arc::new(Request::new(spec, engine));
            request.set_status(status);
            let mut scheduler = self.scheduler.lock().await;
            if scheduler.registry.get(request.target()).is_none() {
                scheduler.registry.insert(request);
            }
        }
        tracing::info!(loaded, "restored persisted requests");
        Ok(())
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Registers a request and tries to admit it.
    ///
    /// Submitting a target that is already registered returns the existing
    /// request untouched; no second transfer is started.
    pub async fn submit(self: &Arc<Self>, spec: RequestSpec) -> Result<Arc<Request>, ManagerError> {
        validate_spec(&spec)?;
        if let Some(existing) = self.get(&spec.target).await {
            tracing::debug!(url = %spec.target, "target already registered");
            return Ok(existing);
        }

        // Engine construction may touch the disk, so it happens outside the lock.
        let engine = self.factory.create(&spec).await?;

        let request = {
            let mut guard = self.scheduler.lock().await;
            let scheduler = &mut *guard;
            if let Some(existing) = scheduler.registry.get(&spec.target) {
                tracing::debug!(url = %spec.target, "target registered concurrently");
                return Ok(existing.clone());
            }

            let request = Arc::new(Request::new(spec, engine));
            scheduler.registry.insert(request.clone());
            tracing::info!(url = %request.target(), destination = %request.destination().display(), "added request");
            self.events.publish(DownloadEvent::Added {
                target: request.target().to_string(),
            });
            request.set_state(RequestState::Queued);
            self.admit(scheduler);
            request
        };

        self.persist(&request).await;
        Ok(request)
    }

    /// Submits every spec and resolves once each resulting request has settled.
    ///
    /// All specs are validated before any is registered. A failure to create
    /// one request's engine does not withdraw the others; the first such error
    /// is returned after the rest have settled.
    pub async fn submit_many<I>(self: &Arc<Self>, specs: I) -> Result<Vec<Arc<Request>>, ManagerError>
    where
        I: IntoIterator<Item = RequestSpec>,
    {
        let specs: Vec<RequestSpec> = specs.into_iter().collect();
        for spec in &specs {
            validate_spec(spec)?;
        }

        let mut requests = Vec::with_capacity(specs.len());
        let mut first_error = None;
        for spec in specs {
            match self.submit(spec).await {
                Ok(request) => requests.push(request),
                Err(e) => {
                    tracing::warn!(error = %e, "submit failed within batch");
                    first_error.get_or_insert(e);
                }
            }
        }

        join_all(requests.iter().map(|request| request.wait())).await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(requests),
        }
    }

    /// Number of requests currently holding an admission slot.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn concurrency_ceiling(&self) -> usize {
        self.scheduler.lock().await.ceiling
    }

    /// Changes the admission limit. Raising it admits queued requests at once;
    /// lowering it lets running transfers finish without preempting them.
    pub async fn set_concurrency_ceiling(self: &Arc<Self>, ceiling: usize) -> Result<(), ManagerError> {
        check_ceiling(ceiling)?;
        let mut guard = self.scheduler.lock().await;
        let scheduler = &mut *guard;
        tracing::info!(old = scheduler.ceiling, new = ceiling, "concurrency ceiling changed");
        scheduler.ceiling = ceiling;
        self.admit(scheduler);
        Ok(())
    }

    pub async fn get(&self, target: &str) -> Option<Arc<Request>> {
        self.scheduler.lock().await.registry.get(target).cloned()
    }

    /// All registered requests in registry order.
    pub async fn requests(&self) -> Vec<Arc<Request>> {
        self.scheduler.lock().await.registry.requests()
    }

    /// Cancels a queued or active request.
    ///
    /// A queued request becomes `Cancelled` immediately. An active one has its
    /// engine cancelled; its slot is released and the `Cancelled` event fires
    /// when the engine run ends.
    pub async fn cancel(&self, target: &str) -> Result<(), ManagerError> {
        let request = {
            let mut guard = self.scheduler.lock().await;
            let entry = guard
                .registry
                .entry_mut(target)
                .ok_or_else(|| ManagerError::NotFound(target.to_string()))?;
            self.cancel_entry(entry)?;
            entry.request.clone()
        };
        self.persist(&request).await;
        Ok(())
    }

    /// Cancels every queued or active request, returning how many were hit.
    pub async fn cancel_all(&self) -> usize {
        let cancelled: Vec<Arc<Request>> = {
            let mut guard = self.scheduler.lock().await;
            guard
                .registry
                .entries
                .iter_mut()
                .filter(|entry| entry.request.state().is_pending())
                .filter_map(|entry| {
                    self.cancel_entry(entry).ok()?;
                    Some(entry.request.clone())
                })
                .collect()
        };
        if !cancelled.is_empty() {
            tracing::info!(cancelled = cancelled.len(), "cancelled all pending requests");
        }
        for request in &cancelled {
            self.persist(request).await;
        }
        cancelled.len()
    }

    fn cancel_entry(&self, entry: &mut Entry) -> Result<(), ManagerError> {
        let request = &entry.request;
        match request.state() {
            RequestState::Queued => {
                tracing::info!(url = %request.target(), "cancelled queued request");
                request.set_state(RequestState::Cancelled);
                self.events.publish(DownloadEvent::Cancelled {
                    target: request.target().to_string(),
                });
                Ok(())
            }
            RequestState::Active => {
                tracing::info!(url = %request.target(), "cancelling active transfer");
                if let Some(token) = &entry.cancel {
                    token.cancel();
                }
                Ok(())
            }
            state => Err(ManagerError::NotCancellable {
                target: request.target().to_string(),
                state,
            }),
        }
    }

    /// Re-queues an idle (failed or restored) or cancelled request. Its storage
    /// keeps what was already downloaded, so the engine continues from there.
    pub async fn resume(self: &Arc<Self>, target: &str) -> Result<(), ManagerError> {
        let request = {
            let mut guard = self.scheduler.lock().await;
            let scheduler = &mut *guard;
            let request = scheduler
                .registry
                .get(target)
                .cloned()
                .ok_or_else(|| ManagerError::NotFound(target.to_string()))?;
            match request.state() {
                RequestState::Idle | RequestState::Cancelled => {
                    tracing::info!(url = target, "resuming request");
                    request.set_status(RequestStatus {
                        state: RequestState::Queued,
                        last_error: None,
                    });
                    self.admit(scheduler);
                }
                state => {
                    return Err(ManagerError::NotResumable {
                        target: target.to_string(),
                        state,
                    })
                }
            }
            request
        };
        self.persist(&request).await;
        Ok(())
    }

    /// Forgets a request that is neither queued nor active, together with its
    /// persisted record. Its storage is dropped with it.
    pub async fn remove(&self, target: &str) -> Result<Arc<Request>, ManagerError> {
        let request = {
            let mut guard = self.scheduler.lock().await;
            let request = guard
                .registry
                .get(target)
                .cloned()
                .ok_or_else(|| ManagerError::NotFound(target.to_string()))?;
            if request.state().is_pending() {
                return Err(ManagerError::Busy(target.to_string()));
            }
            guard.registry.remove(target);
            request
        };
        if let Some(state_manager) = &self.state_manager {
            let _persisting = self.persist_lock.lock().await;
            state_manager.delete_request(target).await?;
        }
        tracing::info!(url = target, "removed request");
        Ok(request)
    }

    /// Storage snapshot of a request that is not currently transferring.
    pub async fn snapshot(&self, target: &str) -> Result<StorageSnapshot, ManagerError> {
        let request = self
            .get(target)
            .await
            .ok_or_else(|| ManagerError::NotFound(target.to_string()))?;
        if request.state() == RequestState::Active {
            return Err(ManagerError::Busy(target.to_string()));
        }
        let engine = request
            .engine
            .try_lock()
            .map_err(|_| ManagerError::Busy(target.to_string()))?;
        Ok(engine.storage().snapshot().await?)
    }

    /// Cancels everything and empties the registry (and the persisted state).
    ///
    /// Transfers still winding down release their slots when they end.
    pub async fn clear(&self) -> Result<(), ManagerError> {
        let removed = {
            let mut guard = self.scheduler.lock().await;
            for entry in guard.registry.entries.iter_mut() {
                if entry.request.state().is_pending() {
                    let _ = self.cancel_entry(entry);
                }
            }
            guard.registry.take().len()
        };
        tracing::info!(removed, "cleared registry");
        if let Some(state_manager) = &self.state_manager {
            let _persisting = self.persist_lock.lock().await;
            state_manager.clear().await?;
        }
        Ok(())
    }

    /// Admits queued requests in registry order until the ceiling is reached.
    fn admit(self: &Arc<Self>, scheduler: &mut Scheduler) {
        while self.active_count() < scheduler.ceiling {
            let Some(entry) = scheduler.registry.next_queued() else {
                break;
            };
            let token = CancellationToken::new();
            entry.cancel = Some(token.clone());
            let request = entry.request.clone();
            request.set_state(RequestState::Active);

            let active = self.claim_slot(scheduler.ceiling);
            tracing::debug!(url = %request.target(), active, ceiling = scheduler.ceiling, "admitted request");
            self.spawn_transfer(request, token);
        }
    }

    fn claim_slot(&self, ceiling: usize) -> usize {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(active <= ceiling, "active transfers {active} exceed ceiling {ceiling}");
        if active > ceiling {
            tracing::error!(active, ceiling, "active transfer count exceeds ceiling");
        }
        active
    }

    fn release_slot(&self) -> usize {
        let previous = self.active.load(Ordering::SeqCst);
        debug_assert!(previous > 0, "active transfer count would go negative");
        if previous == 0 {
            tracing::error!("active transfer count would go negative, clamping to zero");
            return 0;
        }
        self.active.store(previous - 1, Ordering::SeqCst);
        previous - 1
    }

    fn spawn_transfer(self: &Arc<Self>, request: Arc<Request>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager.run_transfer(&request, cancel).await;
            manager.finish(request, outcome).await;
        });
    }

    async fn run_transfer(&self, request: &Request, cancel: CancellationToken) -> TransferOutcome {
        let ctx = TransferContext {
            target: request.target().to_string(),
            destination: request.destination().to_path_buf(),
            sha256: request.spec().sha256.clone(),
            reporter: ProgressReporter::new(request.target(), self.events.clone()),
            cancel: cancel.clone(),
        };

        let mut engine = request.engine.lock().await;
        let result = tokio::select! {
            result = engine.transfer(ctx) => result,
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        };
        match result {
            Ok(()) => TransferOutcome::Completed,
            Err(TransferError::Cancelled) => TransferOutcome::Cancelled,
            Err(e) => TransferOutcome::Failed(e.to_string()),
        }
    }

    /// Completion path for every engine run: releases the slot, records the
    /// outcome, and gives the next queued request its chance.
    async fn finish(self: &Arc<Self>, request: Arc<Request>, outcome: TransferOutcome) {
        {
            let mut guard = self.scheduler.lock().await;
            let scheduler = &mut *guard;
            let active = self.release_slot();

            if let Some(entry) = scheduler.registry.entry_mut(request.target()) {
                if Arc::ptr_eq(&entry.request, &request) {
                    entry.cancel = None;
                }
            }

            let target = request.target().to_string();
            match outcome {
                TransferOutcome::Completed => {
                    tracing::info!(url = %target, active, "request completed");
                    request.set_status(RequestStatus {
                        state: RequestState::Complete,
                        last_error: None,
                    });
                    self.events.publish(DownloadEvent::Completed { target });
                }
                TransferOutcome::Cancelled => {
                    tracing::info!(url = %target, active, "request cancelled");
                    request.set_state(RequestState::Cancelled);
                    self.events.publish(DownloadEvent::Cancelled { target });
                }
                TransferOutcome::Failed(error) => {
                    tracing::warn!(url = %target, active, %error, "request failed");
                    request.fail(error.clone());
                    self.events.publish(DownloadEvent::Failed { target, error });
                }
            }

            self.admit(scheduler);
        }

        self.persist(&request).await;
    }

    /// Saves the request's current record, with a storage snapshot when the
    /// request is resumable and its storage does not survive on its own.
    /// Requests no longer registered are skipped. Failures are logged, not
    /// propagated.
    async fn persist(&self, request: &Arc<Request>) {
        let Some(state_manager) = &self.state_manager else {
            return;
        };
        let _persisting = self.persist_lock.lock().await;
        if !self.is_registered(request).await {
            return;
        }

        let record = request.record();
        let snapshot = match record.status.state {
            RequestState::Idle | RequestState::Cancelled => self.resumable_snapshot(request).await,
            _ => None,
        };
        if let Err(e) = state_manager.save_request(&record, snapshot.as_ref()).await {
            tracing::warn!(url = %request.target(), error = %e, "failed to persist request");
        }
    }

    async fn is_registered(&self, request: &Arc<Request>) -> bool {
        let scheduler = self.scheduler.lock().await;
        scheduler
            .registry
            .get(request.target())
            .is_some_and(|registered| Arc::ptr_eq(registered, request))
    }

    async fn resumable_snapshot(&self, request: &Request) -> Option<StorageSnapshot> {
        // A locked engine means the request was admitted again in the meantime.
        let engine = request.engine.try_lock().ok()?;
        let storage = engine.storage();
        if storage.is_durable() {
            return None;
        }
        match storage.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(url = %request.target(), error = %e, "snapshot failed");
                None
            }
        }
    }
}

fn check_ceiling(ceiling: usize) -> Result<(), ManagerError> {
    if ceiling == 0 {
        return Err(ManagerError::InvalidArgument(
            "concurrency ceiling must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_spec(spec: &RequestSpec) -> Result<(), ManagerError> {
    if spec.target.trim().is_empty() {
        return Err(ManagerError::InvalidArgument("target must not be empty".to_string()));
    }
    if spec.destination.as_os_str().is_empty() {
        return Err(ManagerError::InvalidArgument(
            "destination must not be empty".to_string(),
        ));
    }
    Ok(())
}
