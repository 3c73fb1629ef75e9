use std::sync::Arc;
use std::time::Instant;

/// Typed progress events from long-running operations (downloads,
/// extraction, disk copies) to any observer.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A new phase of a multi-step operation has begun.
    Phase { name: String },
    /// Byte-level transfer progress. `total` is 0 when unknown.
    Transfer {
        done: u64,
        total: u64,
        percent: f64,
        bytes_per_sec: f64,
        eta_secs: Option<u64>,
    },
    /// The operation failed.
    Error { message: String },
    /// The operation completed.
    Done,
}

/// Observer callback. Must be cheap; the reporter coalesces events so a
/// slow observer never blocks the producer for long.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A callback that discards all events.
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Minimum interval between Transfer emissions.
const EMIT_INTERVAL_MS: u128 = 200;

/// Accumulates transferred bytes and emits time-throttled `Transfer`
/// events with speed and ETA.
pub struct TransferReporter {
    callback: ProgressFn,
    total: u64,
    done: u64,
    last_emit: Option<Instant>,
    bytes_at_last_emit: u64,
}

impl TransferReporter {
    /// `initial` counts bytes already present (resumed downloads);
    /// `total` is the expected final size, 0 when unknown.
    pub fn new(callback: ProgressFn, initial: u64, total: u64) -> Self {
        Self {
            callback,
            total,
            done: initial,
            last_emit: None,
            bytes_at_last_emit: initial,
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    /// Record `n` freshly transferred bytes, emitting at most one
    /// Transfer event per 200 ms window.
    pub fn add(&mut self, n: u64) {
        self.done += n;
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last).as_millis() < EMIT_INTERVAL_MS => {}
            _ => {
                let elapsed = self
                    .last_emit
                    .map(|last| now.duration_since(last).as_secs_f64())
                    .unwrap_or(0.0);
                let delta = self.done - self.bytes_at_last_emit;
                let speed = if elapsed > 0.0 {
                    delta as f64 / elapsed
                } else {
                    0.0
                };
                self.emit(speed);
                self.last_emit = Some(now);
                self.bytes_at_last_emit = self.done;
            }
        }
    }

    /// Emit a final Transfer event regardless of throttling.
    pub fn finish(&mut self) {
        self.emit(0.0);
    }

    fn emit(&self, bytes_per_sec: f64) {
        let percent = if self.total > 0 {
            (self.done as f64 / self.total as f64) * 100.0
        } else {
            0.0
        };
        let eta_secs = if bytes_per_sec > 0.0 && self.total > self.done {
            Some(((self.total - self.done) as f64 / bytes_per_sec) as u64)
        } else {
            None
        };
        (self.callback)(ProgressEvent::Transfer {
            done: self.done,
            total: self.total,
            percent,
            bytes_per_sec,
            eta_secs,
        });
    }
}
