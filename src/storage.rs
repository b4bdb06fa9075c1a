use crate::models::{now_unix, ModelKey, StorageRecord};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Artifact file name inside each versioned directory.
const ARTIFACT_FILE: &str = "model.bin";
/// Sidecar metadata file name next to the artifact.
const SIDECAR_FILE: &str = "model.json";
/// Suffix of in-progress transfers in the scratch area.
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create {path}: {source}")]
    PathCreation {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Owns the on-disk store layout:
///
/// ```text
/// <root>/models/<name>/<version>/model.bin    installed artifact
/// <root>/models/<name>/<version>/model.json   StorageRecord sidecar
/// <root>/scratch/<name>-<version>.partial     in-progress transfer
/// ```
///
/// The scratch area sits outside the versioned tree so a partial download
/// can never be mistaken for an installed model. Each key maps to a
/// distinct subtree, so operations are safe to call concurrently.
#[derive(Debug)]
pub struct ModelStore {
    root: PathBuf,
    models_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl ModelStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let models_dir = root.join("models");
        let scratch_dir = root.join("scratch");
        for dir in [&models_dir, &scratch_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::PathCreation {
                path: dir.clone(),
                source,
            })?;
        }
        debug!(root = %root.display(), "model store opened");
        Ok(Self {
            root,
            models_dir,
            scratch_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.models_dir.join(name).join(version)
    }

    /// Deterministic path for a model (its version directory) or, with no
    /// version, the model's name directory. Creates intermediate
    /// directories on demand.
    pub async fn resolve_path(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        let dir = match version {
            Some(v) => self.version_dir(name, v),
            None => self.models_dir.join(name),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::PathCreation {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    /// Final path of the installed artifact for a key. Does not create
    /// anything and does not imply the artifact exists.
    pub fn artifact_path(&self, key: &ModelKey) -> PathBuf {
        self.version_dir(&key.name, &key.version).join(ARTIFACT_FILE)
    }

    fn sidecar_path(&self, key: &ModelKey) -> PathBuf {
        self.version_dir(&key.name, &key.version).join(SIDECAR_FILE)
    }

    /// Scratch-area path for a key's in-progress transfer.
    pub fn partial_path(&self, key: &ModelKey) -> PathBuf {
        self.scratch_dir
            .join(format!("{}-{}{}", key.name, key.version, PARTIAL_SUFFIX))
    }

    /// True iff the resolved path exists and contains the artifact file.
    /// With no version, true if any version of the model is installed.
    pub async fn is_installed(&self, name: &str, version: Option<&str>) -> bool {
        match version {
            Some(v) => {
                let key = ModelKey::new(name, v);
                tokio::fs::try_exists(self.artifact_path(&key))
                    .await
                    .unwrap_or(false)
            }
            None => self
                .installed_versions(name)
                .await
                .map(|v| !v.is_empty())
                .unwrap_or(false),
        }
    }

    async fn installed_versions(&self, name: &str) -> Result<Vec<String>, StorageError> {
        let name_dir = self.models_dir.join(name);
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&name_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let version = entry.file_name().to_string_lossy().into_owned();
            let key = ModelKey::new(name, version.clone());
            if tokio::fs::try_exists(self.artifact_path(&key))
                .await
                .unwrap_or(false)
            {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Scan the store tree for installed models. The scan is the source of
    /// truth: a sidecar is loaded when present, otherwise a record is
    /// synthesized from file attributes, so external deletions or additions
    /// are reflected on the next call.
    pub async fn list_installed(&self) -> Result<Vec<StorageRecord>, StorageError> {
        let mut records = Vec::new();
        let mut names = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(name_entry) = names.next_entry().await? {
            if !name_entry.file_type().await?.is_dir() {
                continue;
            }
            let name = name_entry.file_name().to_string_lossy().into_owned();
            for version in self.installed_versions(&name).await? {
                let key = ModelKey::new(name.clone(), version);
                if let Some(record) = self.load_record(&key).await? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Load the record for one installed key, synthesizing it when the
    /// sidecar is missing or unreadable. Returns `None` if the artifact
    /// itself is absent.
    pub async fn load_record(&self, key: &ModelKey) -> Result<Option<StorageRecord>, StorageError> {
        let artifact = self.artifact_path(key);
        let meta = match tokio::fs::metadata(&artifact).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::read(self.sidecar_path(key)).await {
            Ok(bytes) => match serde_json::from_slice::<StorageRecord>(&bytes) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable sidecar, synthesizing record");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %key, "no sidecar, synthesizing record from file attributes");
            }
            Err(e) => return Err(e.into()),
        }
        let installed_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_else(now_unix);
        Ok(Some(StorageRecord {
            name: key.name.clone(),
            version: key.version.clone(),
            path: artifact,
            size_bytes: meta.len(),
            sha256: None,
            installed_at_unix: installed_at,
            last_used_unix: installed_at,
        }))
    }

    /// Atomically install a verified partial file into its versioned slot
    /// and write the sidecar record. The rename stays within the store
    /// root, so it never crosses filesystems.
    pub async fn install(
        &self,
        key: &ModelKey,
        partial: &Path,
        sha256: Option<String>,
    ) -> Result<StorageRecord, StorageError> {
        self.resolve_path(&key.name, Some(&key.version)).await?;
        let artifact = self.artifact_path(key);
        tokio::fs::rename(partial, &artifact).await?;

        let size = tokio::fs::metadata(&artifact).await?.len();
        let now = now_unix();
        let record = StorageRecord {
            name: key.name.clone(),
            version: key.version.clone(),
            path: artifact,
            size_bytes: size,
            sha256,
            installed_at_unix: now,
            last_used_unix: now,
        };
        self.write_record(key, &record).await?;
        info!(key = %key, size_bytes = size, "model installed");
        Ok(record)
    }

    async fn write_record(
        &self,
        key: &ModelKey,
        record: &StorageRecord,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(self.sidecar_path(key), bytes).await?;
        Ok(())
    }

    /// Bump the last-used timestamp of an installed model. A missing
    /// sidecar is rebuilt from file attributes first.
    pub async fn mark_used(&self, key: &ModelKey) -> Result<(), StorageError> {
        if let Some(mut record) = self.load_record(key).await? {
            record.last_used_unix = now_unix();
            self.write_record(key, &record).await?;
        }
        Ok(())
    }

    /// Remove a version directory, or the whole model when no version is
    /// given. Idempotent: absent paths are not an error. Any partial for
    /// the removed version is discarded too.
    pub async fn delete(&self, name: &str, version: Option<&str>) -> Result<(), StorageError> {
        let dir = match version {
            Some(v) => {
                let key = ModelKey::new(name, v);
                remove_file_if_exists(&self.partial_path(&key)).await?;
                self.version_dir(name, v)
            }
            None => {
                for v in self.installed_versions(name).await? {
                    let key = ModelKey::new(name, v);
                    remove_file_if_exists(&self.partial_path(&key)).await?;
                }
                self.models_dir.join(name)
            }
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(name, version = version.unwrap_or("*"), "model deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes available on the filesystem holding the store. Queried live,
    /// never cached.
    pub fn available_space(&self) -> Result<u64, StorageError> {
        Ok(fs2::available_space(&self.root)?)
    }

    /// Total bytes held by the store (installed artifacts plus scratch).
    /// Queried live by walking the tree.
    pub async fn used_space(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        let mut stack = vec![self.models_dir.clone(), self.scratch_dir.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    total += entry.metadata().await?.len();
                }
            }
        }
        Ok(total)
    }

    /// Remove scratch-area partial files whose last modification is older
    /// than the threshold. Returns the number of files removed.
    pub async fn cleanup_stale(&self, older_than: Duration) -> Result<usize, StorageError> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.scratch_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let age = entry
                .metadata()
                .await?
                .modified()
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            if age.map_or(false, |age| age >= older_than) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "removed stale partial");
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
