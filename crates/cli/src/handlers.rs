//! Command handlers for batchpilot CLI

use crate::wizard::run_init_wizard;
use anyhow::Result;
use batchpilot_core::config::{load_config_from, validate_upload_config};
use batchpilot_core::{
    get_config_path, load_config, select_strategy, validate_config, BatchOutcome, ConfigFile,
    Coordinator, Error, FileStatus, HttpBatchApi, HttpTransport, Orchestrator, PollBudget,
    ProgressEvent, ProgressUpdate, RunOutcome, StaticToken, UploadConfig, UploadFile,
    UploadReport,
};
use clap::Command;
use clap_complete::{generate, Shell as ClapShell};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Overrides given on the `upload` command line
#[derive(Debug, Default)]
pub struct UploadOptions {
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub user_id: Option<String>,
    pub output: Option<String>,
    pub progress: bool,
}

/// Load the configuration from an explicit path or the default location
pub fn load(config_path: Option<&Path>) -> Result<ConfigFile> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn build_api(config: &ConfigFile) -> Result<HttpBatchApi> {
    let timeout = Duration::from_secs(config.api.request_timeout_secs);
    let mut api = HttpBatchApi::new(config.api.endpoint.clone(), timeout)?;
    if let Some(token) = &config.api.token {
        api = api.with_tokens(Arc::new(StaticToken::new(token.clone())));
    }
    Ok(api)
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Interrupted, stopping after in-flight requests...");
            token.cancel();
        }
    });
}

/// Handle init command
pub async fn handle_init(config_path: Option<&Path>) -> Result<()> {
    run_init_wizard(config_path).await
}

/// Handle config commands
pub async fn handle_config(action: &str, config_path: Option<&Path>) -> Result<()> {
    match action {
        "show" => {
            println!("Current configuration:");
            println!();

            let config = load(config_path)?;

            println!("API:");
            println!("  Endpoint: {}", config.api.endpoint);
            println!(
                "  Auth: {}",
                if config.api.token.is_some() {
                    "Bearer token"
                } else {
                    "None"
                }
            );
            println!("  User ID: {}", config.api.user_id.as_deref().unwrap_or("-"));
            println!("  Request timeout: {}s", config.api.request_timeout_secs);
            println!();

            let upload = &config.upload;
            println!("Upload:");
            println!("  Direct threshold: {} files", upload.direct_threshold);
            println!("  Adaptive threshold: {} files", upload.adaptive_threshold);
            println!("  Batch size: {} (adaptive max {})", upload.batch_size, upload.max_batch_size);
            println!("  Max concurrency: {}", upload.max_concurrency);
            println!("  Poll: every {}ms for up to {}s", upload.poll_interval_ms, upload.poll_budget_secs);
            println!(
                "  Retry: {} attempts, backoff {}ms..{}ms",
                upload.max_attempts, upload.backoff_base_ms, upload.backoff_cap_ms
            );
            println!("  Compression above: {}", format_bytes(upload.compression_threshold_bytes));
            println!("  Bandwidth ceiling: {}/s", format_bytes(upload.bandwidth_ceiling_bytes_per_sec));

            Ok(())
        }
        "validate" => {
            println!("Validating configuration...");

            let config = load(config_path)?;
            validate_config(&config)?;
            println!("  ✅ Valid configuration format");

            Ok(())
        }
        "path" => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => get_config_path()?,
            };
            println!("{}", path.display());
            Ok(())
        }
        _ => {
            println!("Unknown action: {}", action);
            println!("Available actions: show, validate, path");
            Ok(())
        }
    }
}

/// Expand directories into the files below them, keeping argument order
fn collect_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if !path.exists() {
            return Err(anyhow::anyhow!("File not found: {}", path.display()));
        }

        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }

    Ok(files)
}

/// Draw a bar from progress updates until the run finishes
async fn render_progress(mut updates: broadcast::Receiver<ProgressUpdate>) {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);

    loop {
        match updates.recv().await {
            Ok(update) => {
                let snapshot = &update.snapshot;
                match &update.event {
                    ProgressEvent::RunStarted { total_files, .. } => pb.set_length(*total_files as u64),
                    ProgressEvent::BatchPolled { batch, progress, .. } => {
                        pb.set_message(format!("batch {} processing ({:.0}%)", batch + 1, progress));
                        continue;
                    }
                    ProgressEvent::RunFinished => break,
                    _ => {}
                }
                pb.set_position((snapshot.completed + snapshot.failed) as u64);
                pb.set_message(format!(
                    "{}/s{}",
                    format_bytes(snapshot.throughput_bps as u64),
                    snapshot
                        .eta_secs
                        .map(|eta| format!(", eta {}s", eta))
                        .unwrap_or_default()
                ));
            }
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress display fell behind"),
            Err(RecvError::Closed) => break,
        }
    }

    pb.finish_and_clear();
}

/// Handle upload command
pub async fn handle_upload(paths: &[PathBuf], options: UploadOptions, config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    validate_config(&config)?;

    let mut upload = config.upload.clone();
    if let Some(concurrency) = options.concurrency {
        upload.max_concurrency = concurrency;
    }
    if let Some(batch_size) = options.batch_size {
        upload.batch_size = batch_size;
    }
    validate_upload_config(&upload)?;

    let output = options
        .output
        .clone()
        .or_else(|| config.output.as_ref().map(|o| o.default_format.clone()))
        .unwrap_or_else(|| "table".to_string());
    if !matches!(output.as_str(), "table" | "json") {
        return Err(anyhow::anyhow!("Unknown output format: {} (expected table or json)", output));
    }

    let file_paths = collect_paths(paths)?;
    if file_paths.is_empty() {
        println!("No files to upload");
        return Ok(());
    }

    let mut files = Vec::with_capacity(file_paths.len());
    for path in &file_paths {
        files.push(UploadFile::from_path(path).await?);
    }
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    info!(files = files.len(), bytes = total_bytes, "files fingerprinted");

    if output == "table" {
        println!("Uploading {} file(s) ({})...", files.len(), format_bytes(total_bytes));
    }

    let api = build_api(&config)?;
    let transport = HttpTransport::new(Duration::from_secs(config.api.request_timeout_secs.max(1) * 10))?;
    let orchestrator = Orchestrator::new(Arc::new(api), Arc::new(transport), upload)
        .with_user_id(options.user_id.clone().or_else(|| config.api.user_id.clone()));
    cancel_on_ctrl_c(orchestrator.cancel_token());

    let display = if options.progress && output == "table" {
        Some(tokio::spawn(render_progress(orchestrator.subscribe())))
    } else {
        None
    };

    let result = orchestrator.run(files).await;
    drop(orchestrator);
    if let Some(display) = display {
        let _ = display.await;
    }
    let report = result?;

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.outcome() {
        RunOutcome::Completed => Ok(()),
        RunOutcome::TimedOut => Ok(()),
        RunOutcome::Cancelled => Err(anyhow::anyhow!("Upload cancelled")),
        RunOutcome::Partial => Err(anyhow::anyhow!(
            "{} file(s) failed, {} not attempted",
            report.failed().len(),
            report.not_attempted().len()
        )),
    }
}

fn print_report(report: &UploadReport) {
    #[derive(Tabled)]
    struct FileRow {
        file: String,
        status: String,
        attempts: u32,
        size: String,
        detail: String,
    }

    let rows: Vec<FileRow> = report
        .results
        .iter()
        .map(|r| FileRow {
            file: r.name.clone(),
            status: r.status.label().to_string(),
            attempts: r.attempts,
            size: format_bytes(r.size),
            detail: match &r.status {
                FileStatus::Uploaded { storage_key } => storage_key.clone(),
                FileStatus::Duplicate { of: Some(of), .. } => format!("same as {}", of),
                FileStatus::Duplicate { of: None, .. } => "already uploaded".to_string(),
                FileStatus::Failed { reason } | FileStatus::NotAttempted { reason } => reason.clone(),
            },
        })
        .collect();

    println!();
    println!("{}", Table::new(rows));
    println!();
    println!(
        "Run {} started {}",
        report.run_id,
        report
            .started_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    println!("Strategy: {} (concurrency {})", report.strategy.kind, report.strategy.concurrency);
    println!("  {} {}", style("✅ Uploaded:").green(), report.successful().len());
    println!("  {} {}", style("Duplicates:").dim(), report.duplicates().len());
    if !report.failed().is_empty() {
        println!("  {} {}", style("❌ Failed:").red().bold(), report.failed().len());
    }
    if !report.not_attempted().is_empty() {
        println!("  {} {}", style("⚠️  Not attempted:").yellow(), report.not_attempted().len());
    }
    println!(
        "  Sent {} in {:.1}s",
        format_bytes(report.snapshot.bytes_uploaded),
        report.snapshot.elapsed_secs
    );

    for id in &report.timed_out {
        println!();
        println!("⚠️  Master batch {} may still be processing.", style(id).cyan());
        println!("  Check again later with:");
        println!("  $ batchpilot status {}", id);
    }
}

/// Handle status command
pub async fn handle_status(master_batch_id: &str, budget_secs: Option<u64>, config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    validate_config(&config)?;

    let upload = &config.upload;
    let budget = PollBudget::new(
        Duration::from_millis(upload.poll_interval_ms),
        Duration::from_secs(budget_secs.unwrap_or(upload.poll_budget_secs)),
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let coordinator = Coordinator::new(Arc::new(build_api(&config)?), budget, upload.retry_policy())
        .with_cancellation(cancel);

    println!("Polling master batch {} (up to {}s)...", master_batch_id, budget.timeout.as_secs());
    let (batch, outcome) = coordinator.resume(master_batch_id, budget).await?;

    match outcome {
        BatchOutcome::Ready(targets) => {
            println!("  ✅ Batch completed after {} poll(s)", batch.polls);

            if !targets.is_empty() {
                #[derive(Tabled)]
                struct TargetRow {
                    file: String,
                    key: String,
                    state: String,
                }

                let rows: Vec<TargetRow> = targets
                    .iter()
                    .map(|t| TargetRow {
                        file: t.filename.clone(),
                        key: t.storage_key.clone().unwrap_or_else(|| "-".to_string()),
                        state: match (&t.error, &t.upload_url) {
                            (Some(error), _) => format!("error: {}", error),
                            (None, Some(_)) => "ready".to_string(),
                            (None, None) => "no url".to_string(),
                        },
                    })
                    .collect();

                println!();
                println!("{}", Table::new(rows));
            }
            Ok(())
        }
        BatchOutcome::Failed(reason) => Err(anyhow::anyhow!("Master batch {} failed: {}", master_batch_id, reason)),
        BatchOutcome::TimedOut { master_batch_id, elapsed } => {
            println!("  ⚠️  No terminal status after {} poll(s), try again later", batch.polls);
            Err(Error::Timeout { master_batch_id, elapsed }.into())
        }
    }
}

/// Handle plan command
pub async fn handle_plan(count: usize, config_path: Option<&Path>) -> Result<()> {
    // A missing config file just means defaults
    let upload = load(config_path)
        .map(|c| c.upload)
        .unwrap_or_else(|_| UploadConfig::default());

    let strategy = select_strategy(count, &upload.strategy_config());

    println!("Strategy for {} file(s): {}", count, strategy.kind);
    println!("  Concurrency: {}", strategy.concurrency);
    match strategy.batch_size {
        Some(size) => println!(
            "  Batches: {} of up to {} files",
            strategy.batch_count(count),
            size
        ),
        None => println!("  Batches: {} (single handshake)", strategy.batch_count(count)),
    }
    println!("  Throttling: {}", if strategy.throttling { "on" } else { "off" });

    Ok(())
}

/// Format bytes to human-readable size
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Handle shell completion generation
pub async fn handle_completion(shell: &str, cmd: &mut Command) -> Result<()> {
    use std::io;

    let clap_shell = match shell {
        "bash" => ClapShell::Bash,
        "zsh" => ClapShell::Zsh,
        "fish" => ClapShell::Fish,
        "elvish" => ClapShell::Elvish,
        "powershell" | "pwsh" => ClapShell::PowerShell,
        _ => {
            return Err(anyhow::anyhow!(
                "Unsupported shell: {}\nSupported shells: bash, zsh, fish, elvish, powershell",
                shell
            ));
        }
    };

    generate(clap_shell, cmd, "batchpilot", &mut io::stdout());

    eprintln!();
    eprintln!("Installation:");
    match clap_shell {
        ClapShell::Bash => eprintln!("  batchpilot completion bash > ~/.local/share/bash-completion/completions/batchpilot"),
        ClapShell::Zsh => eprintln!("  batchpilot completion zsh > ~/.zsh/completion/_batchpilot"),
        ClapShell::Fish => eprintln!("  batchpilot completion fish > ~/.config/fish/completions/batchpilot.fish"),
        ClapShell::Elvish => eprintln!("  batchpilot completion elvish > ~/.elvish/lib/batchpilot.elv"),
        _ => eprintln!("  batchpilot completion powershell > $PROFILE"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.00 MB");
    }

    #[test]
    fn test_collect_paths_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("nested").join("a.txt"), b"a").unwrap();
        let single = dir.path().join("single.txt");
        std::fs::write(&single, b"s").unwrap();

        let files = collect_paths(&[single.clone(), dir.path().join("nested")]).unwrap();
        assert_eq!(files, vec![single, dir.path().join("nested").join("a.txt")]);

        let all = collect_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_collect_paths_missing_file() {
        let err = collect_paths(&[PathBuf::from("/definitely/not/here.bin")]).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }
}
