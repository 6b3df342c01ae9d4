//! In-memory doubles for the batch API and the transport

use crate::api::{BatchApi, InitiateRequest, InitiateResponse, StatusResponse, UploadTarget};
use crate::error::{Error, Result};
use crate::transfer::{ByteProgress, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) const STORAGE_HOST: &str = "https://storage.test";

pub(crate) fn target_for(master_batch_id: &str, filename: &str) -> UploadTarget {
    UploadTarget {
        filename: filename.to_string(),
        upload_url: Some(format!("{}/{}/{}", STORAGE_HOST, master_batch_id, filename)),
        content_type: None,
        storage_key: Some(format!("uploads/{}", filename)),
        error: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// Targets come back with the initiate response
    Immediate,
    /// Targets come back on the n-th status poll
    Polled(u32),
    NeverReady,
    MissingId,
    FailingStatus,
}

#[derive(Default)]
struct ApiState {
    initiates: Vec<InitiateRequest>,
    pending: HashMap<String, Vec<UploadTarget>>,
    polls: HashMap<String, u32>,
    initiate_errors: u32,
    status_errors: u32,
    status_denied: bool,
    rejected: HashSet<String>,
    omitted: HashSet<String>,
}

/// Scriptable [`BatchApi`]
pub(crate) struct MockApi {
    mode: Mode,
    state: Mutex<ApiState>,
    status_calls: AtomicUsize,
}

impl MockApi {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            state: Mutex::new(ApiState::default()),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn immediate() -> Self {
        Self::with_mode(Mode::Immediate)
    }

    pub fn polled(ready_on: u32) -> Self {
        Self::with_mode(Mode::Polled(ready_on.max(1)))
    }

    pub fn never_ready() -> Self {
        Self::with_mode(Mode::NeverReady)
    }

    pub fn missing_id() -> Self {
        Self::with_mode(Mode::MissingId)
    }

    pub fn failing_status() -> Self {
        Self::with_mode(Mode::FailingStatus)
    }

    /// First `n` initiate calls fail with a transient error
    pub fn with_initiate_errors(self, n: u32) -> Self {
        self.state.lock().unwrap().initiate_errors = n;
        self
    }

    /// First `n` status calls fail with a transient error
    pub fn with_status_errors(self, n: u32) -> Self {
        self.state.lock().unwrap().status_errors = n;
        self
    }

    /// Every status call fails with an authentication error
    pub fn with_status_denied(self) -> Self {
        self.state.lock().unwrap().status_denied = true;
        self
    }

    /// Hand out a target carrying an error for this file name
    pub fn reject(self, filename: &str) -> Self {
        self.state.lock().unwrap().rejected.insert(filename.to_string());
        self
    }

    /// Leave this file name out of the targets
    pub fn omit(self, filename: &str) -> Self {
        self.state.lock().unwrap().omitted.insert(filename.to_string());
        self
    }

    /// Make a master batch known without an initiate call
    pub fn register(&self, master_batch_id: &str, filenames: Vec<&str>) {
        let targets = filenames
            .into_iter()
            .map(|f| target_for(master_batch_id, f))
            .collect();
        self.state
            .lock()
            .unwrap()
            .pending
            .insert(master_batch_id.to_string(), targets);
    }

    pub fn initiates(&self) -> Vec<InitiateRequest> {
        self.state.lock().unwrap().initiates.clone()
    }

    pub fn initiate_calls(&self) -> usize {
        self.state.lock().unwrap().initiates.len()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn targets(state: &ApiState, master_batch_id: &str, request: &InitiateRequest) -> Vec<UploadTarget> {
        request
            .files
            .iter()
            .filter(|f| !state.omitted.contains(&f.filename))
            .map(|f| {
                let mut target = target_for(master_batch_id, &f.filename);
                if state.rejected.contains(&f.filename) {
                    target.upload_url = None;
                    target.error = Some("rejected by server".to_string());
                }
                target
            })
            .collect()
    }
}

#[async_trait]
impl BatchApi for MockApi {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse> {
        let mut state = self.state.lock().unwrap();
        state.initiates.push(request.clone());

        if state.initiate_errors > 0 {
            state.initiate_errors -= 1;
            return Err(Error::TransientNetwork("HTTP 503: unavailable".to_string()));
        }

        if self.mode == Mode::MissingId {
            return Ok(InitiateResponse {
                total_files: Some(request.files.len() as u64),
                ..InitiateResponse::default()
            });
        }

        let master_batch_id = format!("mb-{}", state.initiates.len());
        let targets = Self::targets(&state, &master_batch_id, request);

        let upload_urls = if self.mode == Mode::Immediate {
            Some(targets)
        } else {
            state.pending.insert(master_batch_id.clone(), targets);
            None
        };

        Ok(InitiateResponse {
            master_batch_id: Some(master_batch_id),
            total_files: Some(request.files.len() as u64),
            total_batches: Some(1),
            upload_urls,
        })
    }

    async fn status(&self, master_batch_id: &str) -> Result<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if state.status_errors > 0 {
            state.status_errors -= 1;
            return Err(Error::TransientNetwork("connection reset".to_string()));
        }
        if state.status_denied {
            return Err(Error::Authentication("Credential rejected after renewal".to_string()));
        }

        let polls = {
            let count = state.polls.entry(master_batch_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let processing = StatusResponse {
            status: "processing".to_string(),
            progress: Some(50.0),
            ..StatusResponse::default()
        };

        match self.mode {
            Mode::FailingStatus => Ok(StatusResponse {
                status: "failed".to_string(),
                error: Some("thumbnail service down".to_string()),
                ..StatusResponse::default()
            }),
            Mode::Polled(ready_on) if polls >= ready_on => Ok(StatusResponse {
                status: "completed".to_string(),
                progress: Some(100.0),
                upload_urls: state.pending.get(master_batch_id).cloned(),
                ..StatusResponse::default()
            }),
            _ => Ok(processing),
        }
    }
}

/// One recorded PUT
#[derive(Debug, Clone)]
pub(crate) struct RecordedPut {
    pub url: String,
    pub content_type: String,
    pub size: usize,
}

#[derive(Default)]
struct TransportState {
    puts: Vec<RecordedPut>,
    failures: HashMap<String, u32>,
}

/// [`Transport`] that records calls and fails on request
#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<TransportState>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every PUT takes this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `n` PUTs to `url` fail
    pub fn fail_first(&self, url: &str, n: u32) {
        self.state.lock().unwrap().failures.insert(url.to_string(), n);
    }

    pub fn puts(&self) -> Vec<RecordedPut> {
        self.state.lock().unwrap().puts.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().puts.len()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.state.lock().unwrap().puts.iter().filter(|p| p.url == url).count()
    }

    /// Highest number of PUTs seen in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn put(&self, url: &str, content_type: &str, body: Bytes, on_progress: ByteProgress) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        on_progress(body.len() as u64);

        let fail = {
            let mut state = self.state.lock().unwrap();
            state.puts.push(RecordedPut {
                url: url.to_string(),
                content_type: content_type.to_string(),
                size: body.len(),
            });
            match state.failures.get_mut(url) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        if fail {
            return Err(Error::Transfer("HTTP 503: slow down".to_string()));
        }
        Ok(())
    }
}
