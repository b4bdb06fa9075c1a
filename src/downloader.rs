use crate::progress::SpeedWindow;
use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors from a single transfer attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned status {status}")]
    Server { status: u16, transient: bool },
    #[error("no data received for {0:?}, transfer stalled")]
    Stalled(Duration),
    #[error("insufficient disk space while writing")]
    InsufficientDiskSpace,
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("transfer ended early: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
    #[error("transfer paused")]
    Paused,
    #[error("transfer cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether a retry (with the partial file kept for resume) can succeed.
    /// 4xx responses, disk exhaustion, and local I/O faults cannot be fixed
    /// by retrying; timeouts, 5xx, stalls, and short reads can.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Server { transient, .. } => *transient,
            DownloadError::Stalled(_) => true,
            DownloadError::Truncated { .. } => true,
            DownloadError::InsufficientDiskSpace
            | DownloadError::Io(_)
            | DownloadError::Paused
            | DownloadError::Cancelled => false,
        }
    }
}

fn classify_io(e: std::io::Error) -> DownloadError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        DownloadError::InsufficientDiskSpace
    } else {
        DownloadError::Io(e)
    }
}

/// Cooperative control handles for one transfer. The engine observes both
/// flags at every chunk boundary, so reaction latency is bounded by one
/// chunk-write.
#[derive(Debug, Clone)]
pub struct TransferControl {
    pub pause: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

impl TransferControl {
    pub fn new() -> Self {
        Self {
            pause: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-level progress reported from inside a transfer.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub bytes: u64,
    /// Total expected bytes, when the server reported a length.
    pub total: Option<u64>,
    pub speed_bps: Option<f64>,
    pub eta: Option<Duration>,
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum time without receiving a chunk before the attempt is
    /// abandoned as stalled (transient, resumable).
    pub stall_timeout: Duration,
    /// Minimum interval between progress callbacks.
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(250),
        }
    }
}

/// Performs one resumable transfer attempt into a partial file.
///
/// Resume works by issuing a byte-range request starting at the partial
/// file's current length. A server that ignores the range (plain `200`)
/// forces a restart from zero: the partial is truncated, a warning is
/// logged, and the next progress callback reports the reset offset.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    config: EngineConfig,
}

impl Downloader {
    pub fn new(client: Client, config: EngineConfig) -> Self {
        Self { client, config }
    }

    /// Transfer `url` into `partial`, resuming from its existing length.
    /// On success returns the final byte count on disk, flushed and synced.
    /// Progress callbacks fire at most once per `progress_interval`, in
    /// non-decreasing byte order, with one immediate callback once the
    /// response headers arrive.
    pub async fn fetch(
        &self,
        url: &str,
        partial: &Path,
        control: &TransferControl,
        on_progress: &mut (dyn FnMut(ProgressUpdate) + Send),
    ) -> Result<u64, DownloadError> {
        let mut resume_from = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let response = loop {
            let mut request = self.client.get(url);
            if resume_from > 0 {
                request = request.header(header::RANGE, format!("bytes={resume_from}-"));
            }
            let response = request.send().await?;
            match response.status() {
                StatusCode::RANGE_NOT_SATISFIABLE if resume_from > 0 => {
                    // Our partial no longer lines up with the remote file.
                    warn!(url, resume_from, "range not satisfiable, restarting from zero");
                    resume_from = 0;
                    continue;
                }
                _ => break response,
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Server {
                status: status.as_u16(),
                transient: status.is_server_error(),
            });
        }

        let mut offset = resume_from;
        if status == StatusCode::OK && resume_from > 0 {
            // Server does not support partial ranges: restart explicitly
            // rather than silently appending a corrupt concatenation.
            warn!(url, discarded_bytes = resume_from, "server ignored range request, restarting from zero");
            offset = 0;
        } else if status == StatusCode::PARTIAL_CONTENT {
            debug!(url, resume_from, "resuming from byte offset");
        }

        let total = response.content_length().map(|len| offset + len);

        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(classify_io)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(partial)
            .await
            .map_err(classify_io)?;
        file.set_len(offset).await.map_err(classify_io)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(classify_io)?;

        let mut window = SpeedWindow::default();
        let mut written = offset;
        let mut last_emit: Option<Instant> = None;
        on_progress(ProgressUpdate {
            bytes: written,
            total,
            speed_bps: None,
            eta: None,
        });

        let mut stream = response.bytes_stream();
        loop {
            if control.cancel.is_cancelled() {
                // Flush before handing back so the coordinator's cleanup
                // never races a write in flight.
                let _ = file.flush().await;
                return Err(DownloadError::Cancelled);
            }
            if control.pause.load(Ordering::SeqCst) {
                file.flush().await.map_err(classify_io)?;
                file.sync_all().await.map_err(classify_io)?;
                return Err(DownloadError::Paused);
            }

            let chunk = match tokio::time::timeout(self.config.stall_timeout, stream.next()).await {
                Err(_) => {
                    let _ = file.flush().await;
                    let _ = file.sync_all().await;
                    return Err(DownloadError::Stalled(self.config.stall_timeout));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            file.write_all(&chunk).await.map_err(classify_io)?;
            written += chunk.len() as u64;
            window.record(chunk.len() as u64);

            let due = last_emit.map_or(true, |at| at.elapsed() >= self.config.progress_interval);
            if due {
                last_emit = Some(Instant::now());
                let remaining = total.map(|t| t.saturating_sub(written)).unwrap_or(0);
                on_progress(ProgressUpdate {
                    bytes: written,
                    total,
                    speed_bps: window.speed_bps(),
                    eta: window.eta(remaining),
                });
            }
        }

        file.flush().await.map_err(classify_io)?;
        file.sync_all().await.map_err(classify_io)?;

        if let Some(expected) = total {
            if written < expected {
                return Err(DownloadError::Truncated {
                    expected,
                    received: written,
                });
            }
        }

        on_progress(ProgressUpdate {
            bytes: written,
            total: Some(total.unwrap_or(written)),
            speed_bps: window.speed_bps(),
            eta: Some(Duration::ZERO),
        });
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        assert!(DownloadError::Server {
            status: 503,
            transient: true
        }
        .is_transient());
        assert!(!DownloadError::Server {
            status: 404,
            transient: false
        }
        .is_transient());
        assert!(DownloadError::Stalled(Duration::from_secs(30)).is_transient());
        assert!(DownloadError::Truncated {
            expected: 10,
            received: 5
        }
        .is_transient());
        assert!(!DownloadError::InsufficientDiskSpace.is_transient());
        assert!(!DownloadError::Cancelled.is_transient());
    }

    #[test]
    fn storage_full_maps_to_disk_space_error() {
        let e = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space");
        assert!(matches!(classify_io(e), DownloadError::InsufficientDiskSpace));
        let e = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(classify_io(e), DownloadError::Io(_)));
    }
}
