pub mod config;
pub mod downloader;
pub mod engine;
pub mod events;
pub mod integrity;
pub mod logging;
pub mod manager;
pub mod request;
pub mod state_manager;
pub mod storage;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{ManagerConfig, StorageKind};
    pub use crate::downloader::{HttpEngine, HttpEngineFactory};
    pub use crate::engine::{EngineFactory, ProgressReporter, TransferContext, TransferEngine, TransferError};
    pub use crate::events::{DownloadEvent, EventHub};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::request::{Request, RequestSpec, RequestState, RequestStatus};
    pub use crate::state_manager::StateManager;
    pub use crate::storage::{FileStorage, MemoryStorage, Storage, StorageError, StorageSnapshot};
}
