use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable descriptor of a fetchable model artifact.
///
/// Created by the caller and never mutated; the manager clones it into the
/// task it spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Logical model name, e.g. `whisper-base`.
    pub name: String,
    /// Version string, e.g. `1.0`.
    pub version: String,
    /// Source URL for the artifact.
    pub url: String,
    /// Expected SHA-256 digest (lowercase hex). When absent, verification
    /// is skipped with a warning.
    pub sha256: Option<String>,
    /// Estimated artifact size in bytes, used for the disk-space preflight.
    /// Zero means unknown (preflight is skipped).
    pub estimated_size: u64,
    /// Minimum memory the consumer needs to load this model, if known.
    /// Informational; this subsystem does not enforce it.
    pub min_memory_bytes: Option<u64>,
}

impl ModelConfig {
    pub fn key(&self) -> ModelKey {
        ModelKey {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Identity of a model version. Exactly one download task may be active
/// per key at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub name: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Lifecycle state of a download task.
///
/// ```text
/// Pending -> Downloading -> Completed
///              |      ^
///              v      |
///            Paused --+
///              |
///              v
///           Cancelled
/// (Downloading/Paused -> Failed on unrecoverable error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Durable snapshot of one in-flight transfer, written on every state
/// transition so an interrupted download can be resumed after a restart.
/// The byte offset together with the on-disk partial file is the resume
/// token: the next attempt issues a range request starting there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub config: ModelConfig,
    pub state: TaskState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub partial_path: PathBuf,
    pub updated_at_unix: u64,
}

impl TaskRecord {
    pub fn new(config: ModelConfig, partial_path: PathBuf) -> Self {
        Self {
            config,
            state: TaskState::Pending,
            bytes_transferred: 0,
            total_bytes: 0,
            partial_path,
            updated_at_unix: now_unix(),
        }
    }
}

/// Persisted metadata for an installed artifact, stored as a sidecar JSON
/// next to the artifact file. The canonical installed view is derived by
/// scanning the store, so external deletion self-heals on the next query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub installed_at_unix: u64,
    pub last_used_unix: u64,
}

/// Used/available byte counts for the store's filesystem, queried live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageInfo {
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// Seconds since the Unix epoch, saturating at zero for pre-epoch clocks.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
