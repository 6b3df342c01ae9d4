//! Per-file transfer with bounded retry

use crate::api::UploadTarget;
use crate::error::{Error, Result};
use crate::fingerprint::FileDescriptor;
use crate::progress::{ProgressAggregator, ProgressEvent};
use crate::session::UploadSession;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Body, Client};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of the chunks a body is streamed in
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Receives the cumulative number of bytes sent during one attempt
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Moves one body to one upload URL
#[async_trait]
pub trait Transport: Send + Sync {
    async fn put(&self, url: &str, content_type: &str, body: Bytes, on_progress: ByteProgress) -> Result<()>;
}

/// [`Transport`] over plain HTTP PUT
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;
        Ok(Self { http_client })
    }

    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }
}

/// Split a body into [`CHUNK_SIZE`] slices without copying
fn chunked(body: &Bytes) -> Vec<Bytes> {
    (0..body.len())
        .step_by(CHUNK_SIZE)
        .map(|start| body.slice(start..(start + CHUNK_SIZE).min(body.len())))
        .collect()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn put(&self, url: &str, content_type: &str, body: Bytes, on_progress: ByteProgress) -> Result<()> {
        let length = body.len();
        let mut sent = 0u64;
        let stream = futures::stream::iter(chunked(&body))
            .inspect(move |chunk| {
                sent += chunk.len() as u64;
                on_progress(sent);
            })
            .map(Ok::<Bytes, std::io::Error>);

        let response = self
            .http_client
            .put(url)
            .header("Content-Type", content_type)
            .header("Content-Length", length)
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| Error::Transfer(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(Error::Transfer(format!("HTTP {}: {}", status.as_u16(), error_text)))
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt `attempt` (1-based): `min(base * 2^attempt, cap)`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Output of a [`Compressor`]
#[derive(Debug, Clone)]
pub struct Compressed {
    pub data: Bytes,
    pub content_type: String,
}

/// Optional shrinking step for oversized images
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(&self, file: &FileDescriptor, body: Bytes) -> Result<Compressed>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Uploaded { storage_key: String },
    Failed { error: String },
    NotAttempted { reason: String },
}

/// Terminal result of one file's transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub index: usize,
    pub name: String,
    pub outcome: TransferOutcome,
    pub attempts: u32,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Uploaded { .. })
    }
}

/// Uploads single files, retrying failed attempts
#[derive(Clone)]
pub struct TransferWorker {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    session: Arc<UploadSession>,
    progress: Arc<ProgressAggregator>,
    compressor: Option<Arc<dyn Compressor>>,
    cancel: CancellationToken,
}

impl TransferWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        session: Arc<UploadSession>,
        progress: Arc<ProgressAggregator>,
    ) -> Self {
        Self {
            transport,
            retry,
            session,
            progress,
            compressor: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Result for a file whose transfer never started
    pub fn not_attempted(file: &FileDescriptor, reason: impl Into<String>) -> TransferResult {
        TransferResult {
            index: file.index(),
            name: file.name().to_string(),
            outcome: TransferOutcome::NotAttempted { reason: reason.into() },
            attempts: 0,
        }
    }

    /// Record `file` as failed without any transfer attempt
    pub fn reject(&self, file: &FileDescriptor, reason: impl Into<String>) -> TransferResult {
        self.fail(file, reason.into(), 0)
    }

    /// Transfer `file` to `target`. Never returns an error: every failure
    /// ends up in the returned result.
    pub async fn run(&self, file: &FileDescriptor, target: &UploadTarget) -> TransferResult {
        let url = match (&target.error, &target.upload_url) {
            (Some(error), _) => return self.fail(file, format!("Target rejected: {}", error), 0),
            (None, None) => return self.fail(file, "Target carries no upload URL".to_string(), 0),
            (None, Some(url)) => url.clone(),
        };

        let (body, content_type) = match self.prepare_body(file, target).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(file = %file.name(), error = %e, "cannot read file");
                return self.fail(file, format!("Cannot read file: {}", e), 0);
            }
        };
        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts < max_attempts {
            if self.cancel.is_cancelled() {
                return self.cancelled(file, attempts, &last_error);
            }
            attempts += 1;

            let progress = Arc::clone(&self.progress);
            let index = file.index();
            let name = file.name().to_string();
            let size = body.len() as u64;
            let on_progress: ByteProgress = Arc::new(move |sent| progress.file_bytes(index, &name, sent, size));

            debug!(file = %file.name(), attempt = attempts, "uploading");
            match self.transport.put(&url, &content_type, body.clone(), on_progress).await {
                Ok(()) => return self.succeed(file, target, attempts),
                Err(Error::Cancelled) => return self.cancelled(file, attempts, "cancelled during transfer"),
                Err(e) => {
                    last_error = e.to_string();
                    if attempts >= max_attempts {
                        break;
                    }

                    let delay = self.retry.delay_after(attempts);
                    warn!(file = %file.name(), attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "upload attempt failed, retrying");
                    self.progress.emit(ProgressEvent::FileRetrying {
                        file: file.name().to_string(),
                        attempt: attempts,
                        delay_ms: delay.as_millis() as u64,
                        error: last_error.clone(),
                    });

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return self.cancelled(file, attempts, &last_error),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        warn!(file = %file.name(), attempts, error = %last_error, "upload failed");
        self.fail(file, last_error, attempts)
    }

    async fn prepare_body(&self, file: &FileDescriptor, target: &UploadTarget) -> Result<(Bytes, String)> {
        let content_type = target
            .content_type
            .clone()
            .unwrap_or_else(|| file.content_type().to_string());
        let body = file.body().await?;

        let compressor = match &self.compressor {
            Some(c) if file.needs_compression() && file.is_image() => c,
            _ => return Ok((body, content_type)),
        };

        match compressor.compress(file, body.clone()).await {
            Ok(compressed) => {
                debug!(file = %file.name(), from = file.size(), to = compressed.data.len(), "compressed");
                Ok((compressed.data, compressed.content_type))
            }
            Err(e) => {
                warn!(file = %file.name(), error = %e, "compression failed, uploading original");
                Ok((body, content_type))
            }
        }
    }

    fn succeed(&self, file: &FileDescriptor, target: &UploadTarget, attempts: u32) -> TransferResult {
        let storage_key = target
            .storage_key
            .clone()
            .unwrap_or_else(|| file.name().to_string());

        self.session.mark_completed(file.hash());
        self.progress.file_completed(file.index(), file.name(), &storage_key, attempts);
        info!(file = %file.name(), key = %storage_key, attempts, "uploaded");

        TransferResult {
            index: file.index(),
            name: file.name().to_string(),
            outcome: TransferOutcome::Uploaded { storage_key },
            attempts,
        }
    }

    fn fail(&self, file: &FileDescriptor, error: String, attempts: u32) -> TransferResult {
        self.progress.file_failed(file.index(), file.name(), &error, attempts);
        TransferResult {
            index: file.index(),
            name: file.name().to_string(),
            outcome: TransferOutcome::Failed { error },
            attempts,
        }
    }

    fn cancelled(&self, file: &FileDescriptor, attempts: u32, last_error: &str) -> TransferResult {
        if attempts == 0 {
            return Self::not_attempted(file, "cancelled");
        }
        let reason = if last_error.is_empty() {
            "cancelled".to_string()
        } else {
            format!("cancelled after error: {}", last_error)
        };
        self.fail(file, reason, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::UploadFile;
    use crate::testing::MockTransport;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(name: &str, data: &[u8]) -> FileDescriptor {
        FileDescriptor::new(0, UploadFile::new(name, "image/jpeg", data.to_vec()), 1024)
    }

    fn target(url: &str) -> UploadTarget {
        UploadTarget {
            filename: "a.jpg".to_string(),
            upload_url: Some(url.to_string()),
            content_type: None,
            storage_key: Some("users/1/a.jpg".to_string()),
            error: None,
        }
    }

    fn worker(transport: Arc<MockTransport>, max_attempts: u32) -> (TransferWorker, Arc<UploadSession>, Arc<ProgressAggregator>) {
        let session = Arc::new(UploadSession::new());
        let progress = Arc::new(ProgressAggregator::detached(1, 0));
        let retry = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };
        let worker = TransferWorker::new(transport, retry, Arc::clone(&session), Arc::clone(&progress));
        (worker, session, progress)
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_after(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_after(2), Duration::from_millis(4000));
        assert_eq!(retry.delay_after(3), Duration::from_millis(8000));
        assert_eq!(retry.delay_after(4), Duration::from_millis(10_000));
        assert_eq!(retry.delay_after(40), Duration::from_millis(10_000));
    }

    #[test]
    fn test_chunking() {
        let body = Bytes::from(vec![7u8; CHUNK_SIZE * 2 + 10]);
        let chunks = chunked(&body);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 10);
        assert!(chunked(&Bytes::new()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_attempt() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_first("https://s/a.jpg", 2);
        let (worker, session, progress) = worker(Arc::clone(&transport), 3);

        let file = descriptor("a.jpg", b"payload");
        let result = worker.run(&file, &target("https://s/a.jpg")).await;

        assert_eq!(result.attempts, 3);
        assert_eq!(
            result.outcome,
            TransferOutcome::Uploaded {
                storage_key: "users/1/a.jpg".to_string()
            }
        );
        assert_eq!(transport.calls_for("https://s/a.jpg"), 3);
        assert!(session.is_completed(file.hash()));
        assert_eq!(progress.snapshot().completed, 1);
        assert_eq!(progress.snapshot().bytes_uploaded, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_stops_at_limit() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_first("https://s/a.jpg", 10);
        let (worker, session, progress) = worker(Arc::clone(&transport), 3);

        let file = descriptor("a.jpg", b"payload");
        let result = worker.run(&file, &target("https://s/a.jpg")).await;

        assert_eq!(result.attempts, 3);
        assert!(matches!(result.outcome, TransferOutcome::Failed { .. }));
        assert_eq!(transport.calls_for("https://s/a.jpg"), 3);
        assert!(!session.is_completed(file.hash()));
        assert_eq!(progress.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_target_error_fails_without_attempts() {
        let transport = Arc::new(MockTransport::new());
        let (worker, _, progress) = worker(Arc::clone(&transport), 3);

        let mut rejected = target("https://s/a.jpg");
        rejected.error = Some("quota exceeded".to_string());
        let result = worker.run(&descriptor("a.jpg", b"x"), &rejected).await;
        assert_eq!(result.attempts, 0);
        assert!(matches!(result.outcome, TransferOutcome::Failed { .. }));

        assert_eq!(transport.call_count(), 0);
        assert_eq!(progress.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_released_body_fails_without_attempts() {
        let transport = Arc::new(MockTransport::new());
        let (worker, _, progress) = worker(Arc::clone(&transport), 3);

        let mut file = descriptor("a.jpg", b"x");
        file.release();
        let result = worker.run(&file, &target("https://s/a.jpg")).await;

        assert_eq!(result.attempts, 0);
        assert!(matches!(result.outcome, TransferOutcome::Failed { ref error } if error.starts_with("Cannot read file")));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(progress.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_not_attempted() {
        let transport = Arc::new(MockTransport::new());
        let (worker, _, _) = worker(Arc::clone(&transport), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = worker.with_cancellation(cancel);

        let result = worker.run(&descriptor("a.jpg", b"x"), &target("https://s/a.jpg")).await;
        assert!(matches!(result.outcome, TransferOutcome::NotAttempted { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_first("https://s/a.jpg", 10);
        let (worker, _, _) = worker(Arc::clone(&transport), 3);
        let cancel = CancellationToken::new();
        let worker = worker.with_cancellation(cancel.clone());

        let file = descriptor("a.jpg", b"x");
        let handle = tokio::spawn(async move { worker.run(&file, &target("https://s/a.jpg")).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.attempts, 1);
        assert!(matches!(result.outcome, TransferOutcome::Failed { .. }));
        assert_eq!(transport.calls_for("https://s/a.jpg"), 1);
    }

    struct Halver;

    #[async_trait]
    impl Compressor for Halver {
        async fn compress(&self, _file: &FileDescriptor, body: Bytes) -> Result<Compressed> {
            let half = body.slice(0..body.len() / 2);
            Ok(Compressed {
                data: half,
                content_type: "image/webp".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_compressor_applies_to_large_images() {
        let transport = Arc::new(MockTransport::new());
        let (worker, _, _) = worker(Arc::clone(&transport), 3);
        let worker = worker.with_compressor(Some(Arc::new(Halver)));

        let big = descriptor("big.jpg", &[1u8; 2048]);
        worker.run(&big, &target("https://s/big.jpg")).await;
        let small = descriptor("small.jpg", &[1u8; 16]);
        worker.run(&small, &target("https://s/small.jpg")).await;

        let puts = transport.puts();
        assert_eq!(puts[0].content_type, "image/webp");
        assert_eq!(puts[0].size, 1024);
        assert_eq!(puts[1].content_type, "image/jpeg");
        assert_eq!(puts[1].size, 16);
    }

    #[tokio::test]
    async fn test_http_transport_puts_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/a.bin"))
            .and(header("Content-Type", "application/octet-stream"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let body = Bytes::from(vec![0u8; CHUNK_SIZE + 1]);

        transport
            .put(
                &format!("{}/bucket/a.bin", server.uri()),
                "application/octet-stream",
                body,
                Arc::new(move |sent| s.store(sent, std::sync::atomic::Ordering::SeqCst)),
            )
            .await
            .unwrap();

        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), CHUNK_SIZE as u64 + 1);
        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body.len(), CHUNK_SIZE + 1);
    }

    #[tokio::test]
    async fn test_http_transport_non_2xx_is_transfer_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("expired"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport
            .put(&format!("{}/x", server.uri()), "text/plain", Bytes::from_static(b"x"), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(ref m) if m.contains("403")));
    }
}
