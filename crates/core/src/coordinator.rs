//! Batch lifecycle: initiate, poll, resolve upload targets
//!
//! A batch moves `Pending -> Initiating -> Processing` and ends in one of
//! `Completed`, `Failed` or `TimedOut`. Completed and failed batches are
//! final and answer every later request from their cached outcome.
//! `TimedOut` is the one recoverable end state: [`Coordinator::repoll`]
//! puts it back into processing with a fresh budget.

use crate::api::{BatchApi, InitiateRequest, ManifestEntry, RemoteStatus, UploadTarget};
use crate::error::{Error, Result};
use crate::fingerprint::FileDescriptor;
use crate::progress::{ProgressAggregator, ProgressEvent};
use crate::transfer::RetryPolicy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Initiating,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl BatchStatus {
    fn rank(self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::Initiating => 1,
            BatchStatus::Processing => 2,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::TimedOut => 3,
        }
    }

    /// Completed and failed batches never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Validate a forward transition
    pub fn advance(self, next: BatchStatus) -> Result<BatchStatus> {
        if self == next && !self.is_terminal() {
            return Ok(next);
        }
        if next.rank() > self.rank() {
            return Ok(next);
        }
        Err(Error::InvalidInput(format!(
            "Illegal batch transition {} -> {}",
            self.as_str(),
            next.as_str()
        )))
    }

    pub fn as_str(&self) -> &str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Initiating => "initiating",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How long and how often a batch is polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl PollBudget {
    /// Budget whose attempt limit is `timeout / interval` (at least one poll)
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = (timeout.as_millis() / interval_ms).clamp(1, u32::MAX as u128) as u32;
        Self {
            interval,
            timeout,
            max_attempts: attempts,
        }
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}

/// What a driven batch resolved to
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Upload targets are known
    Ready(Vec<UploadTarget>),
    Failed(String),
    /// Still processing server-side when the budget ran out
    TimedOut {
        master_batch_id: String,
        elapsed: Duration,
    },
}

/// One chunk of a submission and its handshake state
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub files: Vec<FileDescriptor>,
    pub master_batch_id: Option<String>,
    pub progress: f64,
    pub polls: u32,
    status: BatchStatus,
    targets: Option<Vec<UploadTarget>>,
    failure: Option<String>,
    waited: Duration,
}

impl Batch {
    pub fn new(index: usize, files: Vec<FileDescriptor>) -> Self {
        Self {
            index,
            files,
            master_batch_id: None,
            progress: 0.0,
            polls: 0,
            status: BatchStatus::Pending,
            targets: None,
            failure: None,
            waited: Duration::ZERO,
        }
    }

    /// A batch initiated elsewhere, known only by its master id
    pub fn detached(master_batch_id: impl Into<String>) -> Self {
        let mut batch = Self::new(0, Vec::new());
        batch.master_batch_id = Some(master_batch_id.into());
        batch.status = BatchStatus::Processing;
        batch
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn targets(&self) -> Option<&[UploadTarget]> {
        self.targets.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn transition(&mut self, next: BatchStatus) -> Result<()> {
        self.status = self.status.advance(next)?;
        Ok(())
    }

    fn fail(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = BatchStatus::Failed;
            self.failure = Some(reason.into());
        }
    }

    /// Outcome of a batch that has reached an end state
    pub fn outcome(&self) -> Option<BatchOutcome> {
        match self.status {
            BatchStatus::Completed => Some(BatchOutcome::Ready(self.targets.clone().unwrap_or_default())),
            BatchStatus::Failed => Some(BatchOutcome::Failed(
                self.failure.clone().unwrap_or_else(|| "batch failed".to_string()),
            )),
            BatchStatus::TimedOut => Some(BatchOutcome::TimedOut {
                master_batch_id: self.master_batch_id.clone().unwrap_or_default(),
                elapsed: self.waited,
            }),
            _ => None,
        }
    }
}

/// All batches of one run
#[derive(Debug, Clone)]
pub struct MasterBatch {
    pub run_id: Uuid,
    pub batches: Vec<Batch>,
    pub total_files: usize,
    pub total_batches: usize,
}

impl MasterBatch {
    pub fn new(chunks: Vec<Vec<FileDescriptor>>) -> Self {
        let batches: Vec<Batch> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, files)| Batch::new(index, files))
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            total_files: batches.iter().map(|b| b.files.len()).sum(),
            total_batches: batches.len(),
            batches,
        }
    }

    /// Status derived from the batches
    pub fn status(&self) -> BatchStatus {
        let all = |s: BatchStatus| self.batches.iter().all(|b| b.status == s);
        let any = |s: BatchStatus| self.batches.iter().any(|b| b.status == s);

        if all(BatchStatus::Completed) {
            BatchStatus::Completed
        } else if all(BatchStatus::Pending) {
            BatchStatus::Pending
        } else if any(BatchStatus::Initiating) || any(BatchStatus::Processing) || any(BatchStatus::Pending) {
            BatchStatus::Processing
        } else if any(BatchStatus::TimedOut) {
            BatchStatus::TimedOut
        } else {
            BatchStatus::Failed
        }
    }

    /// Master ids of batches that ran out of polling budget
    pub fn timed_out_ids(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter(|b| b.status == BatchStatus::TimedOut)
            .filter_map(|b| b.master_batch_id.clone())
            .collect()
    }
}

/// Current transfer rate as seen by the caller's environment
pub trait BandwidthHint: Send + Sync {
    fn bytes_per_sec(&self) -> Option<f64>;
}

/// Pause between throttled batches for a given bandwidth utilization
pub fn adaptive_delay(utilization: f64) -> Duration {
    if utilization > 0.8 {
        Duration::from_millis(1000)
    } else if utilization > 0.6 {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(100)
    }
}

fn manifest_entry(file: &FileDescriptor) -> ManifestEntry {
    ManifestEntry {
        filename: file.name().to_string(),
        content_type: file.content_type().to_string(),
        file_size: file.size(),
        hash: Some(file.hash().to_string()),
    }
}

/// Drives batches through the initiate / status handshake
pub struct Coordinator {
    api: Arc<dyn BatchApi>,
    budget: PollBudget,
    retry: RetryPolicy,
    user_id: Option<String>,
    progress: Option<Arc<ProgressAggregator>>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(api: Arc<dyn BatchApi>, budget: PollBudget, retry: RetryPolicy) -> Self {
        Self {
            api,
            budget,
            retry,
            user_id: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressAggregator>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn budget(&self) -> PollBudget {
        self.budget
    }

    /// Take a batch as far as it goes: initiate if needed, then poll.
    ///
    /// Batches already in an end state return their cached outcome without
    /// touching the network.
    pub async fn drive(&self, batch: &mut Batch) -> Result<BatchOutcome> {
        if let Some(outcome) = batch.outcome() {
            debug!(batch = batch.index, status = %batch.status, "batch already settled");
            return Ok(outcome);
        }

        if batch.status == BatchStatus::Pending {
            self.initiate(batch).await?;
            if let Some(outcome) = batch.outcome() {
                return Ok(outcome);
            }
        }

        self.poll(batch, self.budget).await
    }

    /// Poll a timed-out batch again under a fresh budget
    pub async fn repoll(&self, batch: &mut Batch, budget: PollBudget) -> Result<BatchOutcome> {
        match batch.status {
            BatchStatus::Completed | BatchStatus::Failed => batch
                .outcome()
                .ok_or_else(|| Error::InvalidInput("settled batch without outcome".to_string())),
            BatchStatus::TimedOut => {
                info!(batch = batch.index, master_batch_id = ?batch.master_batch_id, "re-polling timed out batch");
                batch.status = BatchStatus::Processing;
                self.poll(batch, budget).await
            }
            BatchStatus::Processing => self.poll(batch, budget).await,
            BatchStatus::Pending | BatchStatus::Initiating => Err(Error::InvalidInput(format!(
                "Batch {} has not been initiated",
                batch.index
            ))),
        }
    }

    /// Poll a master batch whose id was obtained out of band
    pub async fn resume(&self, master_batch_id: &str, budget: PollBudget) -> Result<(Batch, BatchOutcome)> {
        let mut batch = Batch::detached(master_batch_id);
        let outcome = self.poll(&mut batch, budget).await?;
        Ok((batch, outcome))
    }

    async fn initiate(&self, batch: &mut Batch) -> Result<()> {
        batch.transition(BatchStatus::Initiating)?;

        let request = InitiateRequest {
            files: batch.files.iter().map(manifest_entry).collect(),
            user_id: self.user_id.clone(),
        };

        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0u32;
        let response = loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            match self.api.initiate(&request).await {
                Ok(response) => break response,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(batch = batch.index, attempt, delay_ms = delay.as_millis() as u64, error = %e, "initiate failed, retrying");
                    self.pause(delay).await?;
                }
                Err(e) if e.is_transient() => {
                    warn!(batch = batch.index, attempt, error = %e, "initiate failed, giving up on batch");
                    batch.fail(format!("Initiate failed after {} attempts: {}", attempt, e));
                    self.finished(batch);
                    return Ok(());
                }
                Err(e) => {
                    batch.fail(e.to_string());
                    self.finished(batch);
                    return Err(e);
                }
            }
        };

        let master_batch_id = match response.master_batch_id() {
            Some(id) => id.to_string(),
            None => {
                batch.fail("Initiate response carries no master batch id");
                self.finished(batch);
                return Err(Error::Validation(
                    "Initiate response carries no master batch id".to_string(),
                ));
            }
        };

        info!(batch = batch.index, %master_batch_id, files = batch.files.len(), "batch initiated");
        batch.master_batch_id = Some(master_batch_id.clone());
        self.emit(ProgressEvent::BatchInitiated {
            batch: batch.index,
            master_batch_id,
            file_count: batch.files.len(),
        });

        match response.immediate_targets() {
            Some(targets) => {
                batch.targets = Some(targets.to_vec());
                batch.progress = 100.0;
                batch.transition(BatchStatus::Completed)?;
                self.finished(batch);
            }
            None => batch.transition(BatchStatus::Processing)?,
        }
        Ok(())
    }

    async fn poll(&self, batch: &mut Batch, budget: PollBudget) -> Result<BatchOutcome> {
        let master_batch_id = batch
            .master_batch_id
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("Batch {} has no master batch id", batch.index)))?;

        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;
            batch.polls += 1;

            match self.api.status(&master_batch_id).await {
                Ok(status) => {
                    if let Some(progress) = status.progress {
                        batch.progress = progress;
                    }
                    self.emit(ProgressEvent::BatchPolled {
                        batch: batch.index,
                        progress: batch.progress,
                        processed_files: status.processed_files.unwrap_or(0),
                        total_files: status.total_files.unwrap_or(batch.files.len() as u64),
                    });

                    let remote = status.remote_status();
                    if remote == RemoteStatus::Failed {
                        let reason = status.failure_reason();
                        warn!(batch = batch.index, %master_batch_id, %reason, "batch failed server-side");
                        batch.fail(reason.clone());
                        self.finished(batch);
                        return Ok(BatchOutcome::Failed(reason));
                    }

                    let targets = status.targets().map(<[UploadTarget]>::to_vec);
                    if targets.is_some() || remote == RemoteStatus::Completed {
                        debug!(batch = batch.index, polls = batch.polls, "batch ready");
                        batch.targets = Some(targets.unwrap_or_default());
                        batch.transition(BatchStatus::Completed)?;
                        self.finished(batch);
                        return Ok(BatchOutcome::Ready(batch.targets.clone().unwrap_or_default()));
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(batch = batch.index, attempt, error = %e, "status poll failed");
                }
                Err(e) => {
                    batch.fail(e.to_string());
                    self.finished(batch);
                    return Err(e);
                }
            }

            let elapsed = started.elapsed();
            if attempt >= budget.max_attempts || elapsed >= budget.timeout {
                batch.waited += elapsed;
                warn!(
                    batch = batch.index,
                    %master_batch_id,
                    polls = attempt,
                    elapsed_secs = elapsed.as_secs(),
                    "poll budget exhausted, batch may still be processing"
                );
                batch.transition(BatchStatus::TimedOut)?;
                self.finished(batch);
                return Ok(BatchOutcome::TimedOut {
                    master_batch_id,
                    elapsed: batch.waited,
                });
            }

            self.pause(budget.interval).await?;
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn finished(&self, batch: &Batch) {
        self.emit(ProgressEvent::BatchFinished {
            batch: batch.index,
            status: batch.status,
        });
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.emit(event);
        }
    }
}
