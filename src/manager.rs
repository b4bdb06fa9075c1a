use crate::downloader::{
    DownloadError, Downloader, EngineConfig, ProgressUpdate, TransferControl,
};
use crate::events::{DownloadEvent, EventStream, FailureReason, EVENT_CHANNEL_CAPACITY};
use crate::integrity::{self, IntegrityError};
use crate::models::{
    now_unix, ModelConfig, ModelKey, StorageInfo, StorageRecord, TaskRecord, TaskState,
};
use crate::state_manager::{StateError, StateManager};
use crate::storage::{ModelStore, StorageError};
use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no active download for {0}")]
    TaskNotFound(ModelKey),
}

/// Tuning for the coordinator.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Automatic retry attempts for transient errors before a hard failure.
    pub max_retries: u32,
    /// Base delay of the exponential backoff between retries.
    pub retry_base_delay: Duration,
    /// Cap on the backoff delay.
    pub retry_max_delay: Duration,
    /// Extra disk space demanded by the preflight, in percent of the
    /// estimated artifact size.
    pub preflight_margin_percent: u64,
    /// Age beyond which scratch-area partials are pruned by maintenance.
    pub stale_partial_age: Duration,
    /// Interval of the periodic durable-state save during a transfer.
    pub persist_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            preflight_margin_percent: 10,
            stale_partial_age: Duration::from_secs(7 * 24 * 3600),
            persist_interval: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug)]
struct Snapshot {
    state: TaskState,
    terminal: Option<DownloadEvent>,
}

/// One in-flight download. Owned by the coordinator's active map; the
/// engine only ever borrows the control handles for the duration of a
/// single attempt.
struct ActiveTask {
    key: ModelKey,
    config: ModelConfig,
    events: broadcast::Sender<DownloadEvent>,
    control: TransferControl,
    resume: Notify,
    bytes: AtomicU64,
    total: AtomicU64,
    snapshot: std::sync::Mutex<Snapshot>,
}

impl ActiveTask {
    fn new(key: ModelKey, config: ModelConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            key,
            config,
            events,
            control: TransferControl::new(),
            resume: Notify::new(),
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(0),
            snapshot: std::sync::Mutex::new(Snapshot {
                state: TaskState::Pending,
                terminal: None,
            }),
        }
    }

    fn state(&self) -> TaskState {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn set_state(&self, state: TaskState) {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).state = state;
    }

    /// Broadcast an event, remembering a terminal one for late attachers.
    /// Send errors just mean nobody is listening right now.
    fn emit(&self, event: DownloadEvent) {
        if event.is_terminal() {
            self.snapshot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .terminal = Some(event.clone());
        }
        let _ = self.events.send(event);
    }

    /// Subscribe a new consumer: replay enough of the current state that
    /// the subscriber sees a coherent prefix, then the live channel.
    /// Subscription happens before the snapshot is read, so transitions in
    /// between are duplicated rather than lost (at-least-once delivery).
    fn attach(&self) -> EventStream {
        let rx = self.events.subscribe();
        let snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(terminal) = &snapshot.terminal {
            return EventStream::immediate(vec![terminal.clone()]);
        }
        let replay = match snapshot.state {
            TaskState::Pending => vec![],
            TaskState::Downloading => vec![DownloadEvent::Started],
            TaskState::Paused => vec![DownloadEvent::Started, DownloadEvent::Paused { resumable: true }],
            // Terminal states are covered by the branch above.
            _ => vec![],
        };
        EventStream::attached(replay, rx)
    }

    fn to_record(&self, partial: &Path) -> TaskRecord {
        TaskRecord {
            config: self.config.clone(),
            state: self.state(),
            bytes_transferred: self.bytes.load(Ordering::SeqCst),
            total_bytes: self.total.load(Ordering::SeqCst),
            partial_path: partial.to_path_buf(),
            updated_at_unix: now_unix(),
        }
    }
}

struct Inner {
    store: ModelStore,
    state: StateManager,
    engine: Downloader,
    config: ManagerConfig,
    active: Mutex<HashMap<ModelKey, Arc<ActiveTask>>>,
}

/// Single entry point for "ensure model X version Y is installed".
///
/// Explicitly constructed and injectable; clone handles freely (all clones
/// share the same active set). Deduplicates concurrent requests per model
/// key, sequences engine, validator and store, and fans progress out to
/// every subscriber of a task.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl ModelManager {
    /// Open a manager over a store rooted at `root`. The durable task
    /// database lives inside the root next to the model tree.
    pub async fn new(root: impl Into<PathBuf>, config: ManagerConfig) -> Result<Self, ManagerError> {
        let store = ModelStore::new(root)?;
        let state = StateManager::new(&store.root().join("tasks.db")).await?;
        let client = Client::builder()
            .user_agent(concat!("modelstore/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let engine = Downloader::new(client, config.engine.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                state,
                engine,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Ensure a model is installed, returning its event stream.
    ///
    /// Already installed: the stream immediately replays `Completed`, with
    /// no network activity. A download already in flight for the same key:
    /// the caller attaches to it instead of starting a duplicate transfer.
    /// Failed disk-space preflight: the stream immediately replays
    /// `Failed` and no bytes are written.
    pub async fn ensure_installed(&self, config: ModelConfig) -> Result<EventStream, ManagerError> {
        let key = config.key();
        let mut active = self.inner.active.lock().await;

        if let Some(task) = active.get(&key) {
            debug!(key = %key, "attaching to download already in flight");
            return Ok(task.attach());
        }

        if self.inner.store.is_installed(&key.name, Some(&key.version)).await {
            debug!(key = %key, "already installed");
            let path = self.inner.store.artifact_path(&key);
            return Ok(EventStream::immediate(vec![DownloadEvent::Completed { path }]));
        }

        if config.estimated_size > 0 {
            let margin = self.inner.config.preflight_margin_percent;
            let required = config
                .estimated_size
                .saturating_mul(100 + margin)
                / 100;
            let available = self.inner.store.available_space()?;
            if available < required {
                warn!(key = %key, required, available, "disk-space preflight failed");
                return Ok(EventStream::immediate(vec![DownloadEvent::Failed {
                    reason: FailureReason::InsufficientDiskSpace {
                        required,
                        available,
                    },
                }]));
            }
        }

        info!(key = %key, url = %config.url, "starting download");
        let task = Arc::new(ActiveTask::new(key.clone(), config));
        let stream = task.attach();
        active.insert(key, task.clone());
        drop(active);

        let inner = self.inner.clone();
        tokio::spawn(run_task(inner, task));
        Ok(stream)
    }

    /// Pause an in-flight download. The engine observes the flag at the
    /// next chunk boundary; the task then emits `Paused` and parks until
    /// `resume` or `cancel`.
    pub async fn pause(&self, name: &str, version: &str) -> Result<(), ManagerError> {
        let key = ModelKey::new(name, version);
        let active = self.inner.active.lock().await;
        let task = active.get(&key).ok_or(ManagerError::TaskNotFound(key))?;
        task.control.pause.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resume a paused download from its last acknowledged byte. For a
    /// download that already failed, call `ensure_installed` again instead;
    /// any preserved partial is picked up automatically.
    pub async fn resume(&self, name: &str, version: &str) -> Result<(), ManagerError> {
        let key = ModelKey::new(name, version);
        let active = self.inner.active.lock().await;
        let task = active.get(&key).ok_or(ManagerError::TaskNotFound(key))?;
        task.control.pause.store(false, Ordering::SeqCst);
        task.resume.notify_one();
        Ok(())
    }

    /// Cancel an in-flight download. Cooperative: the partial file and the
    /// durable record are discarded only after the engine acknowledges.
    pub async fn cancel(&self, name: &str, version: &str) -> Result<(), ManagerError> {
        let key = ModelKey::new(name, version);
        let active = self.inner.active.lock().await;
        let task = active.get(&key).ok_or(ManagerError::TaskNotFound(key))?;
        task.control.pause.store(false, Ordering::SeqCst);
        task.control.cancel.cancel();
        // Wake the worker if it is parked in a pause or a backoff wait.
        task.resume.notify_one();
        Ok(())
    }

    /// Installed models, derived by scanning the store tree.
    pub async fn list_installed(&self) -> Result<Vec<StorageRecord>, ManagerError> {
        Ok(self.inner.store.list_installed().await?)
    }

    /// Path of an installed artifact for the consumer to load, bumping the
    /// model's last-used timestamp. `None` if not installed.
    pub async fn resolve_installed(&self, name: &str, version: &str) -> Option<PathBuf> {
        let key = ModelKey::new(name, version);
        if !self.inner.store.is_installed(name, Some(version)).await {
            return None;
        }
        if let Err(e) = self.inner.store.mark_used(&key).await {
            warn!(key = %key, error = %e, "failed to update last-used timestamp");
        }
        Some(self.inner.store.artifact_path(&key))
    }

    /// Re-hash an installed artifact against its recorded digest.
    /// `Ok(None)` when the model is not installed; `Ok(Some(true))` when it
    /// verifies or carries no digest to check against.
    pub async fn verify_installed(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<bool>, ManagerError> {
        let key = ModelKey::new(name, version);
        let Some(record) = self.inner.store.load_record(&key).await? else {
            return Ok(None);
        };
        match record.sha256 {
            Some(expected) => {
                let ok = integrity::verify(&record.path, &expected).await?;
                if !ok {
                    warn!(key = %key, "installed artifact failed verification");
                }
                Ok(Some(ok))
            }
            None => {
                warn!(key = %key, "no recorded checksum, nothing to verify against");
                Ok(Some(true))
            }
        }
    }

    /// Delete installed versions of a model (all versions when `version`
    /// is `None`), cancelling any in-flight download of them first.
    pub async fn delete(&self, name: &str, version: Option<&str>) -> Result<(), ManagerError> {
        {
            let active = self.inner.active.lock().await;
            for (key, task) in active.iter() {
                if key.name == name && version.map_or(true, |v| key.version == v) {
                    task.control.cancel.cancel();
                    task.resume.notify_one();
                }
            }
        }
        self.inner.store.delete(name, version).await?;
        for record in self.inner.state.load_all().await? {
            let key = record.config.key();
            if key.name == name && version.map_or(true, |v| key.version == v) {
                self.inner.state.delete(&key).await?;
            }
        }
        Ok(())
    }

    /// Live used/available byte counts for the store.
    pub async fn storage_info(&self) -> Result<StorageInfo, ManagerError> {
        Ok(StorageInfo {
            used_bytes: self.inner.store.used_space().await?,
            available_bytes: self.inner.store.available_space()?,
        })
    }

    /// Resume downloads interrupted by a previous process. Durable records
    /// whose partial file is still present are restarted (and continue
    /// from their on-disk offset); records whose partial vanished are
    /// discarded. Returns one event stream per resumed download.
    pub async fn recover(&self) -> Result<Vec<EventStream>, ManagerError> {
        let mut streams = Vec::new();
        for record in self.inner.state.load_all().await? {
            let key = record.config.key();
            if self.inner.store.is_installed(&key.name, Some(&key.version)).await {
                debug!(key = %key, "recovery record already installed, dropping");
                self.inner.state.delete(&key).await?;
                continue;
            }
            let partial_present = tokio::fs::try_exists(&record.partial_path)
                .await
                .unwrap_or(false);
            if !partial_present {
                info!(key = %key, "partial file vanished, discarding recovery record");
                self.inner.state.delete(&key).await?;
                continue;
            }
            info!(key = %key, offset = record.bytes_transferred, "resuming interrupted download");
            streams.push(self.ensure_installed(record.config).await?);
        }
        Ok(streams)
    }

    /// One maintenance pass: prune stale partials and drop durable records
    /// whose partial vanished. Run periodically and on startup.
    pub async fn maintain(&self) -> Result<(), ManagerError> {
        let pruned = self
            .inner
            .store
            .cleanup_stale(self.inner.config.stale_partial_age)
            .await?;
        if pruned > 0 {
            info!(pruned, "removed stale partial files");
        }
        let active = self.inner.active.lock().await;
        for record in self.inner.state.load_all().await? {
            let key = record.config.key();
            if active.contains_key(&key) {
                continue;
            }
            let partial_present = tokio::fs::try_exists(&record.partial_path)
                .await
                .unwrap_or(false);
            if !partial_present || self.inner.store.is_installed(&key.name, Some(&key.version)).await
            {
                self.inner.state.delete(&key).await?;
            }
        }
        Ok(())
    }

    /// Run `maintain` forever at the given interval. Spawn from the
    /// composition root; aborting the spawned task stops the loop.
    pub async fn run_maintenance(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.maintain().await {
                warn!(error = %e, "maintenance pass failed");
            }
        }
    }
}

/// Worker for one task: transfer with retries, verify, install, emit the
/// terminal event, then leave the active set.
async fn run_task(inner: Arc<Inner>, task: Arc<ActiveTask>) {
    let key = task.key.clone();
    let partial = inner.store.partial_path(&key);

    task.set_state(TaskState::Downloading);
    task.emit(DownloadEvent::Started);
    persist(&inner, &task, &partial).await;

    // Periodic durable save while the transfer runs, so a crash loses at
    // most persist_interval worth of offset.
    let saver_stop = CancellationToken::new();
    let saver = {
        let inner = inner.clone();
        let task = task.clone();
        let partial = partial.clone();
        let stop = saver_stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.persist_interval) => {}
                    _ = stop.cancelled() => break,
                }
                if task.state() == TaskState::Downloading {
                    persist(&inner, &task, &partial).await;
                }
            }
        })
    };

    let terminal = transfer_and_install(&inner, &task, &partial).await;

    saver_stop.cancel();
    let _ = saver.await;

    task.emit(terminal);
    inner.active.lock().await.remove(&key);
}

async fn transfer_and_install(
    inner: &Arc<Inner>,
    task: &Arc<ActiveTask>,
    partial: &Path,
) -> DownloadEvent {
    let key = &task.key;
    let config = &task.config;
    let mut attempt: u32 = 0;

    loop {
        let mut on_progress = progress_callback(task.clone());
        let result = inner
            .engine
            .fetch(&config.url, partial, &task.control, &mut on_progress)
            .await;

        match result {
            Ok(bytes) => {
                debug!(key = %key, bytes, "transfer complete");
                break;
            }
            Err(DownloadError::Cancelled) => {
                return cancel_cleanup(inner, task, partial).await;
            }
            Err(DownloadError::Paused) => {
                task.set_state(TaskState::Paused);
                persist(inner, task, partial).await;
                task.emit(DownloadEvent::Paused { resumable: true });
                info!(key = %key, "download paused");
                tokio::select! {
                    _ = task.control.cancel.cancelled() => {
                        return cancel_cleanup(inner, task, partial).await;
                    }
                    _ = task.resume.notified() => {
                        if task.control.cancel.is_cancelled() {
                            return cancel_cleanup(inner, task, partial).await;
                        }
                        // An explicit pause/resume cycle resets the retry
                        // budget.
                        attempt = 0;
                        task.set_state(TaskState::Downloading);
                        task.emit(DownloadEvent::Started);
                        info!(key = %key, "download resumed");
                    }
                }
            }
            Err(e) if e.is_transient() && attempt < inner.config.max_retries => {
                attempt += 1;
                let delay = backoff_delay(&inner.config, attempt);
                warn!(
                    key = %key,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient download error, backing off"
                );
                task.set_state(TaskState::Paused);
                persist(inner, task, partial).await;
                task.emit(DownloadEvent::Paused { resumable: true });
                tokio::select! {
                    _ = task.control.cancel.cancelled() => {
                        return cancel_cleanup(inner, task, partial).await;
                    }
                    _ = tokio::time::sleep(delay) => {
                        task.set_state(TaskState::Downloading);
                        task.emit(DownloadEvent::Started);
                    }
                }
            }
            Err(e) => {
                error!(key = %key, error = %e, "download failed");
                task.set_state(TaskState::Failed);
                let reason = match &e {
                    DownloadError::InsufficientDiskSpace => {
                        // Nothing to resume into; free the space we took.
                        let _ = tokio::fs::remove_file(partial).await;
                        let _ = inner.state.delete(key).await;
                        FailureReason::InsufficientDiskSpace {
                            required: config.estimated_size,
                            available: inner.store.available_space().unwrap_or(0),
                        }
                    }
                    DownloadError::Io(io) => {
                        // Partial kept: a local I/O fault may clear after
                        // user remediation.
                        persist(inner, task, partial).await;
                        FailureReason::Storage {
                            detail: io.to_string(),
                        }
                    }
                    DownloadError::Server {
                        transient: false, ..
                    } => {
                        // 4xx: the resource is gone or the request is bad;
                        // the partial cannot be completed against it.
                        let _ = tokio::fs::remove_file(partial).await;
                        let _ = inner.state.delete(key).await;
                        FailureReason::Network {
                            detail: e.to_string(),
                        }
                    }
                    _ => {
                        // Retries exhausted on a transient error: keep the
                        // partial and the durable record so a later
                        // ensure_installed (or startup recovery) resumes.
                        persist(inner, task, partial).await;
                        FailureReason::Network {
                            detail: e.to_string(),
                        }
                    }
                };
                return DownloadEvent::Failed { reason };
            }
        }
    }

    task.emit(DownloadEvent::Installing);

    if let Some(expected) = &config.sha256 {
        match integrity::sha256_sum(partial).await {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => {
                debug!(key = %key, "checksum verified");
            }
            Ok(actual) => {
                warn!(key = %key, expected, actual = %actual, "checksum mismatch, discarding artifact");
                let _ = tokio::fs::remove_file(partial).await;
                let _ = inner.state.delete(key).await;
                task.set_state(TaskState::Failed);
                return DownloadEvent::Failed {
                    reason: FailureReason::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    },
                };
            }
            Err(e) => {
                error!(key = %key, error = %e, "failed to hash downloaded artifact");
                task.set_state(TaskState::Failed);
                persist(inner, task, partial).await;
                return DownloadEvent::Failed {
                    reason: FailureReason::Storage {
                        detail: e.to_string(),
                    },
                };
            }
        }
    } else {
        warn!(key = %key, "no expected checksum provided, skipping verification");
    }

    match inner.store.install(key, partial, config.sha256.clone()).await {
        Ok(record) => {
            let _ = inner.state.delete(key).await;
            task.set_state(TaskState::Completed);
            DownloadEvent::Completed { path: record.path }
        }
        Err(e) => {
            error!(key = %key, error = %e, "install failed");
            task.set_state(TaskState::Failed);
            persist(inner, task, partial).await;
            DownloadEvent::Failed {
                reason: FailureReason::Storage {
                    detail: e.to_string(),
                },
            }
        }
    }
}

/// Cleanup after the engine has acknowledged a cancellation: only then is
/// it safe to delete the partial file.
async fn cancel_cleanup(inner: &Arc<Inner>, task: &Arc<ActiveTask>, partial: &Path) -> DownloadEvent {
    let _ = tokio::fs::remove_file(partial).await;
    let _ = inner.state.delete(&task.key).await;
    task.set_state(TaskState::Cancelled);
    info!(key = %task.key, "download cancelled");
    DownloadEvent::Cancelled
}

async fn persist(inner: &Arc<Inner>, task: &Arc<ActiveTask>, partial: &Path) {
    let record = task.to_record(partial);
    if let Err(e) = inner.state.save(&task.key, &record).await {
        warn!(key = %task.key, error = %e, "failed to persist task state");
    }
}

fn progress_callback(task: Arc<ActiveTask>) -> impl FnMut(ProgressUpdate) + Send {
    move |update: ProgressUpdate| {
        task.bytes.store(update.bytes, Ordering::SeqCst);
        if let Some(total) = update.total {
            task.total.store(total, Ordering::SeqCst);
        }
        let total = task.total.load(Ordering::SeqCst);
        let fraction = if total > 0 {
            (update.bytes as f64 / total as f64) as f32
        } else {
            0.0
        };
        task.emit(DownloadEvent::Progress {
            fraction,
            bytes: update.bytes,
            total,
            speed_bps: update.speed_bps,
            eta: update.eta,
        });
    }
}

fn backoff_delay(config: &ManagerConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config.retry_base_delay.saturating_mul(1 << exponent);
    delay.min(config.retry_max_delay)
}
