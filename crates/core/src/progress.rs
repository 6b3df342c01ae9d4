//! Aggregated run progress
//!
//! Workers and the coordinator report into one [`ProgressAggregator`]. Every
//! mutation happens under a single lock and is followed by a broadcast of the
//! event together with the resulting snapshot, so subscribers (progress bars,
//! logs, tests) see a consistent, ordered view.

use crate::coordinator::BatchStatus;
use crate::strategy::StrategyKind;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

/// Default capacity of the progress channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Create a progress channel; lagging receivers lose the oldest updates
pub fn progress_channel(capacity: usize) -> (broadcast::Sender<ProgressUpdate>, broadcast::Receiver<ProgressUpdate>) {
    broadcast::channel(capacity.max(1))
}

/// Mutable counters of one run
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    pub started_at: Instant,
    /// Throughput (bytes/s) computed at the last byte update
    pub last_throughput: f64,
}

/// Derived, read-only view of the state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    pub percentage: f64,
    pub throughput_bps: f64,
    pub eta_secs: Option<u64>,
    pub elapsed_secs: f64,
}

impl ProgressSnapshot {
    pub fn eta(&self) -> Option<Duration> {
        self.eta_secs.map(Duration::from_secs)
    }
}

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        strategy: StrategyKind,
        total_files: usize,
        total_batches: usize,
    },
    BatchInitiated {
        batch: usize,
        master_batch_id: String,
        file_count: usize,
    },
    BatchPolled {
        batch: usize,
        progress: f64,
        processed_files: u64,
        total_files: u64,
    },
    BatchFinished {
        batch: usize,
        status: BatchStatus,
    },
    FileBytes {
        file: String,
        bytes_sent: u64,
        file_size: u64,
    },
    FileRetrying {
        file: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    FileCompleted {
        file: String,
        storage_key: String,
        attempts: u32,
    },
    FileFailed {
        file: String,
        error: String,
        attempts: u32,
    },
    FileDuplicate {
        file: String,
    },
    RunFinished,
}

/// One notification: the event and the state right after it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub event: ProgressEvent,
    pub snapshot: ProgressSnapshot,
}

struct Inner {
    state: ProgressState,
    /// Highest byte count reported per file, keyed by submission index
    file_bytes: HashMap<usize, u64>,
    finished: HashSet<usize>,
}

/// Single point of mutation for [`ProgressState`]
pub struct ProgressAggregator {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ProgressUpdate>,
}

impl ProgressAggregator {
    pub fn new(total: usize, bytes_total: u64, events: broadcast::Sender<ProgressUpdate>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ProgressState {
                    total,
                    completed: 0,
                    failed: 0,
                    duplicates: 0,
                    bytes_uploaded: 0,
                    bytes_total,
                    started_at: Instant::now(),
                    last_throughput: 0.0,
                },
                file_bytes: HashMap::new(),
                finished: HashSet::new(),
            }),
            events,
        }
    }

    /// Aggregator with a private channel, for callers that only read snapshots
    pub fn detached(total: usize, bytes_total: u64) -> Self {
        let (events, _) = progress_channel(DEFAULT_CHANNEL_CAPACITY);
        Self::new(total, bytes_total, events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.lock();
        snapshot_of(&inner.state)
    }

    /// Publish an event that does not touch the counters
    pub fn emit(&self, event: ProgressEvent) {
        let inner = self.lock();
        self.publish(&inner, event);
    }

    /// Record that `bytes_sent` bytes of file `index` are on the wire.
    ///
    /// Only the part above the file's previous high-water mark counts, so a
    /// retried transfer never inflates the byte total.
    pub fn file_bytes(&self, index: usize, name: &str, bytes_sent: u64, file_size: u64) {
        let mut inner = self.lock();
        let mark = inner.file_bytes.entry(index).or_insert(0);
        if bytes_sent <= *mark {
            return;
        }
        let delta = bytes_sent - *mark;
        *mark = bytes_sent;

        let state = &mut inner.state;
        state.bytes_uploaded += delta;
        let elapsed = state.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            state.last_throughput = state.bytes_uploaded as f64 / elapsed;
        }

        self.publish(
            &inner,
            ProgressEvent::FileBytes {
                file: name.to_string(),
                bytes_sent,
                file_size,
            },
        );
    }

    /// Count file `index` as completed; returns `false` if it was already finalized
    pub fn file_completed(&self, index: usize, name: &str, storage_key: &str, attempts: u32) -> bool {
        let mut inner = self.lock();
        if !Self::finalize(&mut inner, index, name) {
            return false;
        }
        inner.state.completed += 1;
        self.publish(
            &inner,
            ProgressEvent::FileCompleted {
                file: name.to_string(),
                storage_key: storage_key.to_string(),
                attempts,
            },
        );
        true
    }

    /// Count file `index` as failed; returns `false` if it was already finalized
    pub fn file_failed(&self, index: usize, name: &str, error: &str, attempts: u32) -> bool {
        let mut inner = self.lock();
        if !Self::finalize(&mut inner, index, name) {
            return false;
        }
        inner.state.failed += 1;
        self.publish(
            &inner,
            ProgressEvent::FileFailed {
                file: name.to_string(),
                error: error.to_string(),
                attempts,
            },
        );
        true
    }

    pub fn file_duplicate(&self, name: &str) {
        let mut inner = self.lock();
        inner.state.duplicates += 1;
        self.publish(
            &inner,
            ProgressEvent::FileDuplicate {
                file: name.to_string(),
            },
        );
    }

    fn finalize(inner: &mut Inner, index: usize, name: &str) -> bool {
        let state = &inner.state;
        if state.completed + state.failed >= state.total {
            warn!(file = %name, total = state.total, "more results than files, ignoring");
            return false;
        }
        if !inner.finished.insert(index) {
            warn!(file = %name, "file already has a result, ignoring");
            return false;
        }
        true
    }

    fn publish(&self, inner: &Inner, event: ProgressEvent) {
        // No receivers is fine
        let _ = self.events.send(ProgressUpdate {
            event,
            snapshot: snapshot_of(&inner.state),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot_of(state: &ProgressState) -> ProgressSnapshot {
    let elapsed = state.started_at.elapsed().as_secs_f64();

    let percentage = if state.total == 0 {
        0.0
    } else {
        round2(state.completed as f64 / state.total as f64 * 100.0)
    };

    let throughput_bps = if elapsed > 0.0 {
        state.bytes_uploaded as f64 / elapsed
    } else {
        state.last_throughput
    };

    let eta_secs = if state.completed > 0 {
        let remaining = state.total.saturating_sub(state.completed) as f64;
        Some((elapsed / state.completed as f64 * remaining).round() as u64)
    } else {
        None
    };

    ProgressSnapshot {
        total: state.total,
        completed: state.completed,
        failed: state.failed,
        duplicates: state.duplicates,
        bytes_uploaded: state.bytes_uploaded,
        bytes_total: state.bytes_total,
        percentage,
        throughput_bps,
        eta_secs,
        elapsed_secs: elapsed,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
