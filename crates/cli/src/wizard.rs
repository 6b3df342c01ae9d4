//! Interactive setup wizard for batchpilot configuration

use anyhow::Result;
use batchpilot_core::config::save_config_to;
use batchpilot_core::{get_config_path, ApiConfig, ConfigFile, LoggingConfig, UploadConfig};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

/// Run the interactive setup wizard
pub async fn run_init_wizard(config_path: Option<&Path>) -> Result<()> {
    println!("🚀 Welcome to batchpilot setup!\n");

    println!("This wizard will guide you through the configuration process.");
    println!("You will need:");
    println!("  1. The base URL of your upload API");
    println!("  2. A bearer token, if the API requires one");
    println!("  3. Optionally, the user id uploads are filed under\n");

    // Step 1: API endpoint
    let endpoint = prompt_endpoint()?;

    // Step 2: Token
    let token = prompt_token()?;

    // Step 3: User id
    let user_id = prompt_user_id()?;

    // Step 4: Concurrency
    let max_concurrency = prompt_concurrency()?;

    // Summary
    println!("\n📋 Configuration summary:");
    println!("  Endpoint: {}", endpoint);
    println!("  Auth: {}", if token.is_some() { "Bearer token" } else { "None" });
    println!("  User ID: {}", user_id.as_deref().unwrap_or("-"));
    println!("  Max concurrency: {}", max_concurrency);

    // Confirmation
    let confirm = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Save this configuration?")
        .default(false)
        .interact()?;

    if !confirm {
        println!("❌ Configuration cancelled");
        return Ok(());
    }

    // Create config
    let config = ConfigFile {
        api: ApiConfig {
            endpoint,
            token,
            user_id,
            request_timeout_secs: 30,
        },
        upload: UploadConfig {
            max_concurrency,
            ..UploadConfig::default()
        },
        logging: Some(LoggingConfig::default()),
        output: None,
    };

    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    // Save config
    let pb = ProgressBar::new(2);
    pb.set_style(
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.set_message("Saving configuration...");

    save_config_to(&config, &path)?;

    pb.inc(1);
    pb.finish_with_message("✅ Configuration saved!");

    println!("\n🎉 Setup complete!");
    println!("\nConfiguration saved to: {}", path.display());
    println!("\nYou can now use batchpilot:");
    println!("  $ batchpilot upload ./photos");
    println!("  $ batchpilot plan 2500");
    println!("  $ batchpilot config show");

    Ok(())
}

/// Prompt for the API base URL
fn prompt_endpoint() -> Result<String> {
    Input::with_theme(&ColorfulTheme::default())
        .with_prompt("API endpoint")
        .default("https://api.example.com".to_string())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Endpoint cannot be empty")
            } else if !input.starts_with("http://") && !input.starts_with("https://") {
                Err("Endpoint must start with http:// or https://")
            } else {
                Ok(())
            }
        })
        .interact()
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .map_err(|e| anyhow::anyhow!("Failed to get endpoint: {}", e))
}

/// Prompt for an optional bearer token (empty = none)
fn prompt_token() -> Result<Option<String>> {
    let token = Password::with_theme(&ColorfulTheme::default())
        .with_prompt("API token (leave empty for none)")
        .allow_empty_password(true)
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get API token: {}", e))?;

    Ok(Some(token.trim().to_string()).filter(|t| !t.is_empty()))
}

/// Prompt for an optional user id
fn prompt_user_id() -> Result<Option<String>> {
    let user_id: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("User ID (optional)")
        .allow_empty(true)
        .interact_text()
        .map_err(|e| anyhow::anyhow!("Failed to get user id: {}", e))?;

    Ok(Some(user_id.trim().to_string()).filter(|u| !u.is_empty()))
}

/// Prompt for the transfer concurrency
fn prompt_concurrency() -> Result<usize> {
    Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Maximum simultaneous transfers")
        .default(5usize)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if *input == 0 || *input > 64 {
                Err("Concurrency must be between 1 and 64")
            } else {
                Ok(())
            }
        })
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get concurrency: {}", e))
}
