//! Upload run orchestration
//!
//! One [`Orchestrator::run`] call takes a submission from raw files to a
//! per-file report: fingerprint and dedup, pick a strategy, drive the
//! batches through the coordinator and fan transfers out through the
//! limiter.

use crate::api::{BatchApi, UploadTarget};
use crate::config::UploadConfig;
use crate::coordinator::{
    adaptive_delay, BandwidthHint, Batch, BatchOutcome, BatchStatus, Coordinator, MasterBatch,
};
use crate::error::{Error, Result};
use crate::fingerprint::{analyze, FileDescriptor, UploadFile};
use crate::limiter::ConcurrencyLimiter;
use crate::progress::{
    progress_channel, ProgressAggregator, ProgressEvent, ProgressSnapshot, ProgressUpdate,
    DEFAULT_CHANNEL_CAPACITY,
};
use crate::session::UploadSession;
use crate::strategy::{partition, select_strategy, Strategy};
use crate::transfer::{Compressor, TransferOutcome, TransferResult, TransferWorker, Transport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final state of one submitted file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded {
        storage_key: String,
    },
    /// Same content as an earlier file; `of` names it when it was part of this run
    Duplicate {
        of: Option<String>,
        storage_key: Option<String>,
    },
    Failed {
        reason: String,
    },
    NotAttempted {
        reason: String,
    },
}

impl FileStatus {
    pub fn label(&self) -> &str {
        match self {
            FileStatus::Uploaded { .. } => "uploaded",
            FileStatus::Duplicate { .. } => "duplicate",
            FileStatus::Failed { .. } => "failed",
            FileStatus::NotAttempted { .. } => "not attempted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileResult {
    pub index: usize,
    pub name: String,
    pub hash: String,
    pub size: u64,
    #[serde(flatten)]
    pub status: FileStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub index: usize,
    pub master_batch_id: Option<String>,
    pub status: BatchStatus,
    pub file_count: usize,
    pub polls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every file uploaded or deduplicated
    Completed,
    /// Some files failed or were never attempted
    Partial,
    /// At least one batch was still processing when polling stopped
    TimedOut,
    Cancelled,
}

/// Everything a run produced, one entry per submitted file
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub run_id: Uuid,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In submission order
    pub results: Vec<FileResult>,
    pub master_status: BatchStatus,
    pub batches: Vec<BatchSummary>,
    /// Master ids worth re-polling later
    pub timed_out: Vec<String>,
    pub cancelled: bool,
    pub snapshot: ProgressSnapshot,
}

impl UploadReport {
    fn with_status<'a>(&'a self, pred: impl Fn(&FileStatus) -> bool + 'a) -> impl Iterator<Item = &'a FileResult> + 'a {
        self.results.iter().filter(move |r| pred(&r.status))
    }

    pub fn successful(&self) -> Vec<&FileResult> {
        self.with_status(|s| matches!(s, FileStatus::Uploaded { .. })).collect()
    }

    pub fn duplicates(&self) -> Vec<&FileResult> {
        self.with_status(|s| matches!(s, FileStatus::Duplicate { .. })).collect()
    }

    pub fn failed(&self) -> Vec<&FileResult> {
        self.with_status(|s| matches!(s, FileStatus::Failed { .. })).collect()
    }

    pub fn not_attempted(&self) -> Vec<&FileResult> {
        self.with_status(|s| matches!(s, FileStatus::NotAttempted { .. })).collect()
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if !self.timed_out.is_empty() {
            RunOutcome::TimedOut
        } else if self.failed().is_empty() && self.not_attempted().is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::Partial
        }
    }
}

/// Entry point of the upload pipeline
pub struct Orchestrator {
    api: Arc<dyn BatchApi>,
    transport: Arc<dyn Transport>,
    config: UploadConfig,
    user_id: Option<String>,
    session: Arc<UploadSession>,
    compressor: Option<Arc<dyn Compressor>>,
    bandwidth: Option<Arc<dyn BandwidthHint>>,
    events: broadcast::Sender<ProgressUpdate>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn BatchApi>, transport: Arc<dyn Transport>, config: UploadConfig) -> Self {
        let (events, _) = progress_channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            api,
            transport,
            config,
            user_id: None,
            session: Arc::new(UploadSession::new()),
            compressor: None,
            bandwidth: None,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a session (and its completed hashes) with earlier runs
    pub fn with_session(mut self, session: Arc<UploadSession>) -> Self {
        self.session = session;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_bandwidth_hint(mut self, hint: Arc<dyn BandwidthHint>) -> Self {
        self.bandwidth = Some(hint);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Progress updates of every run started after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Arc<UploadSession> {
        &self.session
    }

    /// Upload a submission.
    ///
    /// Per-file problems end up in the report. Only protocol violations,
    /// authentication failures and similar run-level errors are returned as
    /// `Err`, after in-flight transfers have been stopped.
    pub async fn run(&self, files: Vec<UploadFile>) -> Result<UploadReport> {
        let started_at = Utc::now();
        let submitted = files.len();

        let analysis = analyze(files, &self.session, self.config.compression_threshold_bytes);
        let unique_bytes = analysis.unique_bytes();
        let unique_count = analysis.unique.len();
        let duplicates = analysis.duplicates;

        let strategy = select_strategy(unique_count, &self.config.strategy_config());
        let mut master = MasterBatch::new(partition(analysis.unique, strategy.batch_size));
        let progress = Arc::new(ProgressAggregator::new(unique_count, unique_bytes, self.events.clone()));

        info!(
            run_id = %master.run_id,
            strategy = %strategy.kind,
            files = submitted,
            unique = unique_count,
            duplicates = duplicates.len(),
            batches = master.total_batches,
            concurrency = strategy.concurrency,
            "starting upload run"
        );
        progress.emit(ProgressEvent::RunStarted {
            strategy: strategy.kind,
            total_files: unique_count,
            total_batches: master.total_batches,
        });

        let run_cancel = self.cancel.child_token();
        let retry = self.config.retry_policy();
        let coordinator = Coordinator::new(Arc::clone(&self.api), self.config.poll_budget(), retry)
            .with_user_id(self.user_id.clone())
            .with_progress(Arc::clone(&progress))
            .with_cancellation(run_cancel.clone());
        let worker = TransferWorker::new(
            Arc::clone(&self.transport),
            retry,
            Arc::clone(&self.session),
            Arc::clone(&progress),
        )
        .with_compressor(self.compressor.clone())
        .with_cancellation(run_cancel.clone());
        let limiter = ConcurrencyLimiter::new(strategy.concurrency);

        let mut results: Vec<TransferResult> = Vec::with_capacity(unique_count);
        let mut transfers: JoinSet<TransferResult> = JoinSet::new();
        let batch_count = master.batches.len();

        for batch in master.batches.iter_mut() {
            if run_cancel.is_cancelled() {
                break;
            }

            let outcome = match coordinator.drive(batch).await {
                Ok(outcome) => outcome,
                Err(Error::Cancelled) => break,
                Err(e) => {
                    warn!(batch = batch.index, error = %e, "aborting run");
                    run_cancel.cancel();
                    transfers.shutdown().await;
                    return Err(e);
                }
            };

            dispatch(batch, outcome, &worker, &limiter, &run_cancel, &mut transfers, &mut results);

            if strategy.throttling && batch.index + 1 < batch_count {
                while let Some(joined) = transfers.join_next().await {
                    collect(&mut results, joined);
                }

                let delay = adaptive_delay(self.utilization(&progress));
                debug!(batch = batch.index, delay_ms = delay.as_millis() as u64, "throttling before next batch");
                tokio::select! {
                    biased;
                    _ = run_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        while let Some(joined) = transfers.join_next().await {
            collect(&mut results, joined);
        }

        let cancelled = self.cancel.is_cancelled();
        let file_results = resolve(&master, duplicates, results, &progress, cancelled);

        progress.emit(ProgressEvent::RunFinished);
        let report = UploadReport {
            run_id: master.run_id,
            strategy,
            started_at,
            finished_at: Utc::now(),
            results: file_results,
            master_status: master.status(),
            batches: master
                .batches
                .iter()
                .map(|b| BatchSummary {
                    index: b.index,
                    master_batch_id: b.master_batch_id.clone(),
                    status: b.status(),
                    file_count: b.files.len(),
                    polls: b.polls,
                })
                .collect(),
            timed_out: master.timed_out_ids(),
            cancelled,
            snapshot: progress.snapshot(),
        };

        info!(
            run_id = %report.run_id,
            outcome = ?report.outcome(),
            uploaded = report.successful().len(),
            duplicates = report.duplicates().len(),
            failed = report.failed().len(),
            not_attempted = report.not_attempted().len(),
            "upload run finished"
        );
        Ok(report)
    }

    fn utilization(&self, progress: &ProgressAggregator) -> f64 {
        let rate = self
            .bandwidth
            .as_ref()
            .and_then(|hint| hint.bytes_per_sec())
            .unwrap_or_else(|| progress.snapshot().throughput_bps);
        rate / self.config.bandwidth_ceiling_bytes_per_sec.max(1) as f64
    }
}

/// Hand each file of a finished batch to a transfer task or settle it.
///
/// Bodies move into the tasks that upload them; files that will not be sent
/// drop theirs, so the batch keeps metadata only.
fn dispatch(
    batch: &mut Batch,
    outcome: BatchOutcome,
    worker: &TransferWorker,
    limiter: &ConcurrencyLimiter,
    cancel: &CancellationToken,
    transfers: &mut JoinSet<TransferResult>,
    results: &mut Vec<TransferResult>,
) {
    match outcome {
        BatchOutcome::Ready(targets) => {
            let mut by_name = index_targets(targets);
            for file in batch.files.iter_mut() {
                match by_name.get_mut(file.name()).and_then(VecDeque::pop_front) {
                    Some(target) => spawn_transfer(transfers, worker, limiter, cancel, file.detach(), target),
                    None => {
                        file.release();
                        results.push(worker.reject(file, "No upload target returned for file"));
                    }
                }
            }
        }
        BatchOutcome::Failed(reason) => {
            for file in batch.files.iter_mut() {
                file.release();
                results.push(worker.reject(file, format!("Batch failed: {}", reason)));
            }
        }
        BatchOutcome::TimedOut { master_batch_id, .. } => {
            for file in batch.files.iter_mut() {
                file.release();
                results.push(TransferWorker::not_attempted(
                    file,
                    format!("Master batch {} may still be processing", master_batch_id),
                ));
            }
        }
    }
}

/// Targets keyed by file name; repeated names are served in order
fn index_targets(targets: Vec<UploadTarget>) -> HashMap<String, VecDeque<UploadTarget>> {
    let mut by_name: HashMap<String, VecDeque<UploadTarget>> = HashMap::new();
    for target in targets {
        by_name.entry(target.filename.clone()).or_default().push_back(target);
    }
    by_name
}

fn spawn_transfer(
    transfers: &mut JoinSet<TransferResult>,
    worker: &TransferWorker,
    limiter: &ConcurrencyLimiter,
    cancel: &CancellationToken,
    file: FileDescriptor,
    target: UploadTarget,
) {
    let worker = worker.clone();
    let limiter = limiter.clone();
    let cancel = cancel.clone();
    transfers.spawn(async move {
        match limiter.acquire_cancellable(&cancel).await {
            Some(_permit) => worker.run(&file, &target).await,
            None => TransferWorker::not_attempted(&file, "cancelled"),
        }
    });
}

fn collect(results: &mut Vec<TransferResult>, joined: std::result::Result<TransferResult, tokio::task::JoinError>) {
    match joined {
        Ok(result) => results.push(result),
        Err(e) => warn!(error = %e, "transfer task ended without a result"),
    }
}

/// Build the per-file report in submission order
fn resolve(
    master: &MasterBatch,
    duplicates: Vec<FileDescriptor>,
    results: Vec<TransferResult>,
    progress: &ProgressAggregator,
    cancelled: bool,
) -> Vec<FileResult> {
    let mut by_index: HashMap<usize, TransferResult> = results.into_iter().map(|r| (r.index, r)).collect();
    let mut resolved: Vec<FileResult> = Vec::new();

    for file in master.batches.iter().flat_map(|b| b.files.iter()) {
        let (status, attempts) = match by_index.remove(&file.index()) {
            Some(result) => {
                let status = match result.outcome {
                    TransferOutcome::Uploaded { storage_key } => FileStatus::Uploaded { storage_key },
                    TransferOutcome::Failed { error } => FileStatus::Failed { reason: error },
                    TransferOutcome::NotAttempted { reason } => FileStatus::NotAttempted { reason },
                };
                (status, result.attempts)
            }
            None if cancelled => (
                FileStatus::NotAttempted {
                    reason: "cancelled".to_string(),
                },
                0,
            ),
            None => {
                progress.file_failed(file.index(), file.name(), "transfer task ended without a result", 0);
                (
                    FileStatus::Failed {
                        reason: "transfer task ended without a result".to_string(),
                    },
                    0,
                )
            }
        };

        resolved.push(FileResult {
            index: file.index(),
            name: file.name().to_string(),
            hash: file.hash().to_string(),
            size: file.size(),
            status,
            attempts,
        });
    }

    let originals: HashMap<usize, (String, FileStatus)> = resolved
        .iter()
        .map(|r| (r.index, (r.name.clone(), r.status.clone())))
        .collect();

    for file in duplicates {
        let status = match file.duplicate_of().and_then(|i| originals.get(&i)) {
            None => FileStatus::Duplicate {
                of: None,
                storage_key: None,
            },
            Some((name, FileStatus::Uploaded { storage_key })) => FileStatus::Duplicate {
                of: Some(name.clone()),
                storage_key: Some(storage_key.clone()),
            },
            Some((_, mirrored)) => mirrored.clone(),
        };

        if matches!(status, FileStatus::Duplicate { .. }) {
            progress.file_duplicate(file.name());
        }

        resolved.push(FileResult {
            index: file.index(),
            name: file.name().to_string(),
            hash: file.hash().to_string(),
            size: file.size(),
            status,
            attempts: 0,
        });
    }

    resolved.sort_by_key(|r| r.index);
    resolved
}
