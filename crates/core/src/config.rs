//! Configuration management for batchpilot

use crate::coordinator::PollBudget;
use crate::error::{Error, Result};
use crate::strategy::StrategyConfig;
use crate::transfer::RetryPolicy;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration directory name
const CONFIG_DIR: &str = "batchpilot";

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api: ApiConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    pub logging: Option<LoggingConfig>,
    pub output: Option<OutputConfig>,
}

/// Batch API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the upload API (initiate/status live below it)
    pub endpoint: String,

    /// Bearer token sent with initiate/status calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Optional user id forwarded in the initiate manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Upload orchestration tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Unique-file count up to which the direct path is used
    #[serde(default = "default_direct_threshold")]
    pub direct_threshold: usize,
    /// Unique-file count above which adaptive batching with throttling kicks in
    #[serde(default = "default_adaptive_threshold")]
    pub adaptive_threshold: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_budget")]
    pub poll_budget_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: u64,
    #[serde(default = "default_bandwidth_ceiling")]
    pub bandwidth_ceiling_bytes_per_sec: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            direct_threshold: default_direct_threshold(),
            adaptive_threshold: default_adaptive_threshold(),
            batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            max_concurrency: default_max_concurrency(),
            poll_interval_ms: default_poll_interval(),
            poll_budget_secs: default_poll_budget(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            compression_threshold_bytes: default_compression_threshold(),
            bandwidth_ceiling_bytes_per_sec: default_bandwidth_ceiling(),
        }
    }
}

impl UploadConfig {
    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            direct_threshold: self.direct_threshold,
            adaptive_threshold: self.adaptive_threshold,
            batch_size: self.batch_size,
            max_batch_size: self.max_batch_size,
            max_concurrency: self.max_concurrency,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn poll_budget(&self) -> PollBudget {
        PollBudget::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.poll_budget_secs),
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub default_format: String,
}

// Default values
fn default_request_timeout() -> u64 {
    30
}

fn default_direct_threshold() -> usize {
    100
}

fn default_adaptive_threshold() -> usize {
    1000
}

fn default_batch_size() -> usize {
    50
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    2000 // 2 seconds
}

fn default_poll_budget() -> u64 {
    300 // 5 minutes
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_cap() -> u64 {
    10_000
}

fn default_compression_threshold() -> u64 {
    25 * 1024 * 1024 // 25MB
}

fn default_bandwidth_ceiling() -> u64 {
    100 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_output_format() -> String {
    "table".to_string()
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    let config_dir = home.join(".config").join(CONFIG_DIR);

    // Create directory if it doesn't exist
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    Ok(config_dir)
}

/// Get the configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Load configuration from the default location
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from an explicit path
pub fn load_config_from(config_path: &Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        return Err(Error::ConfigNotFound(config_path.to_path_buf()));
    }

    let content = fs::read_to_string(config_path).map_err(|e| {
        Error::InvalidConfig(format!("Failed to read config file: {}", e))
    })?;

    let config: ConfigFile = toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config file: {}", e))
    })?;

    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

/// Save configuration to an explicit path
pub fn save_config_to(config: &ConfigFile, config_path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config).map_err(|e| {
        Error::InvalidConfig(format!("Failed to serialize config: {}", e))
    })?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    fs::write(config_path, content).map_err(|e| {
        Error::Config(format!("Failed to write config file: {}", e))
    })?;

    // The file may hold a bearer token: owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(config_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(config_path, perms)?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ConfigFile) -> Result<()> {
    let endpoint = config.api.endpoint.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput("API endpoint cannot be empty".to_string()));
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(Error::InvalidInput(format!(
            "API endpoint must be an http(s) URL, got '{}'",
            endpoint
        )));
    }

    if let Some(token) = &config.api.token {
        if token.trim().is_empty() {
            return Err(Error::InvalidInput("API token cannot be blank".to_string()));
        }
    }

    validate_upload_config(&config.upload)?;

    if let Some(logging) = &config.logging {
        if !matches!(logging.format.as_str(), "pretty" | "json") {
            return Err(Error::InvalidInput(format!(
                "Unknown log format '{}' (expected pretty or json)",
                logging.format
            )));
        }
    }

    Ok(())
}

/// Validate the upload tuning section on its own (CLI overrides go through this too)
pub fn validate_upload_config(upload: &UploadConfig) -> Result<()> {
    if upload.max_concurrency == 0 || upload.max_concurrency > 64 {
        return Err(Error::InvalidInput(format!(
            "max_concurrency must be between 1 and 64 (got {})",
            upload.max_concurrency
        )));
    }

    if upload.batch_size == 0 || upload.max_batch_size == 0 {
        return Err(Error::InvalidInput("Batch sizes must be at least 1".to_string()));
    }

    if upload.adaptive_threshold < upload.direct_threshold {
        return Err(Error::InvalidInput(
            "adaptive_threshold cannot be lower than direct_threshold".to_string(),
        ));
    }

    if !(1000..=5000).contains(&upload.poll_interval_ms) {
        return Err(Error::InvalidInput(format!(
            "poll_interval_ms must be between 1000 and 5000 (got {})",
            upload.poll_interval_ms
        )));
    }

    if upload.poll_budget_secs == 0 {
        return Err(Error::InvalidInput("poll_budget_secs must be positive".to_string()));
    }

    if upload.max_attempts == 0 {
        return Err(Error::InvalidInput("max_attempts must be at least 1".to_string()));
    }

    if upload.backoff_cap_ms < upload.backoff_base_ms {
        return Err(Error::InvalidInput(
            "backoff_cap_ms cannot be lower than backoff_base_ms".to_string(),
        ));
    }

    Ok(())
}

/// Check if configuration exists
pub fn config_exists() -> bool {
    get_config_path().map(|p| p.exists()).unwrap_or(false)
}

/// Public alias for ConfigFile (used by lib.rs)
pub use ConfigFile as Config;
