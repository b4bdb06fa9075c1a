pub mod downloader;
pub mod events;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod progress;
pub mod state_manager;
pub mod storage;

/// Convenient re-exports of the public surface.
pub mod prelude {
    pub use crate::downloader::{DownloadError, Downloader, EngineConfig, TransferControl};
    pub use crate::events::{DownloadEvent, EventStream, FailureReason};
    pub use crate::manager::{ManagerConfig, ManagerError, ModelManager};
    pub use crate::models::{ModelConfig, ModelKey, StorageInfo, StorageRecord, TaskState};
    pub use crate::state_manager::StateManager;
    pub use crate::storage::{ModelStore, StorageError};
}
