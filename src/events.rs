use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of each task's broadcast channel. Progress events are lossy
/// under backpressure; the terminal event is always the newest and survives.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why a task reached the `Failed` state. Each variant maps to one bucket
/// of the error taxonomy so a UI can offer the right remediation without
/// understanding transport detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Unreachable host, timeout, or server error after retries.
    Network { detail: String },
    /// Downloaded bytes did not match the expected digest.
    ChecksumMismatch { expected: String, actual: String },
    /// Preflight or mid-transfer disk exhaustion.
    InsufficientDiskSpace { required: u64, available: u64 },
    /// Filesystem-level failure (path creation, rename, metadata write).
    Storage { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Network { detail } => {
                write!(f, "network error: {detail} (check connectivity and retry)")
            }
            FailureReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual} (re-download required)")
            }
            FailureReason::InsufficientDiskSpace { required, available } => {
                write!(f, "insufficient disk space: need {required} bytes, {available} available (free up space and retry)")
            }
            FailureReason::Storage { detail } => write!(f, "storage error: {detail}"),
        }
    }
}

/// Events emitted for a single download task, in order, at least once per
/// transition. No event follows a terminal one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started,
    Progress {
        /// Completed fraction in `0.0..=1.0`, zero while the total is unknown.
        fraction: f32,
        bytes: u64,
        total: u64,
        /// Instantaneous speed over the sampling window, `None` until the
        /// window holds enough samples.
        speed_bps: Option<f64>,
        eta: Option<Duration>,
    },
    Installing,
    Completed {
        path: PathBuf,
    },
    Paused {
        resumable: bool,
    },
    Cancelled,
    Failed {
        reason: FailureReason,
    },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed { .. }
                | DownloadEvent::Cancelled
                | DownloadEvent::Failed { .. }
        )
    }
}

/// Per-subscriber view of a task's events: a snapshot replay of the state
/// at attach time, then the live broadcast. Multiple subscribers attached
/// to the same task all observe the same terminal event.
pub struct EventStream {
    replay: VecDeque<DownloadEvent>,
    live: Option<broadcast::Receiver<DownloadEvent>>,
}

impl EventStream {
    /// A stream that delivers the given events and then ends, used when the
    /// outcome is known without starting a transfer (already installed,
    /// failed preflight).
    pub(crate) fn immediate(events: Vec<DownloadEvent>) -> Self {
        Self {
            replay: events.into(),
            live: None,
        }
    }

    /// A stream attached to a running task: `replay` is the snapshot of the
    /// task's current state, `rx` the live channel.
    pub(crate) fn attached(
        replay: Vec<DownloadEvent>,
        rx: broadcast::Receiver<DownloadEvent>,
    ) -> Self {
        Self {
            replay: replay.into(),
            live: Some(rx),
        }
    }

    /// Next event, or `None` once the task is gone and its channel drained.
    /// Dropped progress events (slow consumer) are skipped, never the
    /// terminal event.
    pub async fn next(&mut self) -> Option<DownloadEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        let rx = self.live.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged, skipping progress");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.live = None;
                    return None;
                }
            }
        }
    }

    /// Drain events until a terminal one arrives; returns it, or `None` if
    /// the stream ended without one (task evicted before we attached).
    pub async fn wait_terminal(&mut self) -> Option<DownloadEvent> {
        while let Some(event) = self.next().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}
