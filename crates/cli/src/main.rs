use anyhow::Result;
use clap::{CommandFactory, Parser};
use color_eyre::config::HookBuilder;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod handlers;
mod wizard;

/// batchpilot - batch upload orchestrator
#[derive(Parser, Debug)]
#[command(name = "batchpilot")]
#[command(author = "Kev <kev@m7academy.com>")]
#[command(version)]
#[command(about = "Upload large file sets through a two-step batch API", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "BATCHPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Initial setup (interactive wizard)
    Init,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Upload files and directories
    Upload {
        /// Files or directories (walked recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Maximum simultaneous transfers
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Files per batch for mid-size sets
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// User id sent with the manifest
        #[arg(short, long)]
        user_id: Option<String>,
        /// Output format (table, json)
        #[arg(short, long)]
        output: Option<String>,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Poll a master batch again (after a timeout)
    Status {
        /// Master batch id from an earlier run
        master_batch_id: String,
        /// Polling budget in seconds
        #[arg(long)]
        budget_secs: Option<u64>,
    },

    /// Show the strategy a file count would get
    Plan {
        /// Number of unique files
        count: usize,
    },

    /// Shell completion
    Completion {
        /// Shell type (bash, zsh, fish, elvish, powershell)
        shell: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the current configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

/// Install the tracing subscriber; RUST_LOG wins over the configured level
fn init_logging(config: Option<&Path>) {
    let logging = handlers::load(config)
        .ok()
        .and_then(|c| c.logging)
        .unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,batchpilot={0},batchpilot_core={0}", logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = installed {
        eprintln!("Warning: Failed to install logger: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup error handling
    if let Err(e) = HookBuilder::default().install() {
        eprintln!("Warning: Failed to install error handler: {}", e);
    }

    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    init_logging(config);

    // Execute command
    match cli.command {
        Commands::Init => handlers::handle_init(config).await,
        Commands::Config { action } => {
            let action_str = match action {
                ConfigAction::Show => "show",
                ConfigAction::Validate => "validate",
                ConfigAction::Path => "path",
            };
            handlers::handle_config(action_str, config).await
        }
        Commands::Upload {
            paths,
            concurrency,
            batch_size,
            user_id,
            output,
            no_progress,
        } => {
            let options = handlers::UploadOptions {
                concurrency,
                batch_size,
                user_id,
                output,
                progress: !no_progress,
            };
            handlers::handle_upload(&paths, options, config).await
        }
        Commands::Status {
            master_batch_id,
            budget_secs,
        } => handlers::handle_status(&master_batch_id, budget_secs, config).await,
        Commands::Plan { count } => handlers::handle_plan(count, config).await,
        Commands::Completion { shell } => {
            handlers::handle_completion(&shell, &mut Cli::command()).await
        }
    }
}
