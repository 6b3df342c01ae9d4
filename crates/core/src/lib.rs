//! batchpilot-core - Core library for the batchpilot upload orchestrator
//!
//! This library takes a set of files from raw bytes to storage through a
//! two-step batch API: content fingerprinting and deduplication, strategy
//! selection, batch initiation and status polling, bounded-concurrency
//! transfers with retry, and aggregated progress reporting.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod limiter;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod strategy;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use api::{
    BatchApi, HttpBatchApi, InitiateRequest, InitiateResponse, ManifestEntry, RemoteStatus,
    StaticToken, StatusResponse, TokenProvider, UploadTarget,
};
pub use config::{config_exists, get_config_path, load_config, save_config, validate_config};
pub use config::{ApiConfig, Config, ConfigFile, LoggingConfig, OutputConfig, UploadConfig};
pub use coordinator::{
    adaptive_delay, BandwidthHint, Batch, BatchOutcome, BatchStatus, Coordinator, MasterBatch,
    PollBudget,
};
pub use error::{Error, Result};
pub use fingerprint::{analyze, fingerprint, Analysis, FileDescriptor, FileSource, UploadFile};
pub use limiter::{ConcurrencyLimiter, Permit};
pub use orchestrator::{BatchSummary, FileResult, FileStatus, Orchestrator, RunOutcome, UploadReport};
pub use progress::{ProgressAggregator, ProgressEvent, ProgressSnapshot, ProgressUpdate};
pub use session::UploadSession;
pub use strategy::{partition, select_strategy, Strategy, StrategyConfig, StrategyKind};
pub use transfer::{
    Compressed, Compressor, HttpTransport, RetryPolicy, TransferOutcome, TransferResult,
    TransferWorker, Transport,
};
