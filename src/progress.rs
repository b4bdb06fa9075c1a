use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window of `(timestamp, bytes written)` samples used to derive
/// instantaneous transfer speed and a remaining-time estimate.
///
/// Speed is the byte sum over the window divided by the window's time span.
/// Both speed and ETA are `None` until the window holds at least two
/// samples, and ETA is `None` whenever speed is zero.
#[derive(Debug)]
pub struct SpeedWindow {
    span: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    /// Default window span recommended for download progress reporting.
    pub const DEFAULT_SPAN: Duration = Duration::from_secs(5);

    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    /// Record bytes written now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Record bytes written at an explicit instant. Samples older than the
    /// window span (relative to the newest sample) are evicted.
    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.duration_since(oldest) > self.span && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop all samples, e.g. when a transfer restarts from zero.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Bytes per second over the current window, if computable.
    pub fn speed_bps(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let (first, _) = *self.samples.front()?;
        let (last, _) = *self.samples.back()?;
        let span = last.duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        let bytes: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        Some(bytes as f64 / span)
    }

    /// Estimated time to transfer `remaining` bytes at the current speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.speed_bps()?;
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SPAN)
    }
}
