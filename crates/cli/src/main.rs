//! shelfsync command-line management tool.
//!
//! Provides subcommands for generating and validating configuration files,
//! listing library providers, running a one-shot catalog sync, and checking
//! refresh interval strings.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::models::PassSummary;
use shelfsync_core::notify::BroadcastChannel;
use shelfsync_core::providers::ProviderRegistry;
use shelfsync_core::scheduler::RefreshInterval;
use shelfsync_core::status::SyncStatusRegistry;
use shelfsync_core::sync_engine::SyncEngine;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// shelfsync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "shelfsync",
    version,
    about = "Sync a book catalog from Audiobookshelf and Calibre libraries"
)]
struct Cli {
    /// Path to the TOML configuration file.
    /// Defaults to `~/.config/shelfsync/config.toml`.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./shelfsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// List library providers and whether they are configured.
    Providers,

    /// Run a sync pass now and wait for it to finish.
    Sync {
        /// Sync only this provider (default: every configured provider).
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Check a refresh interval string such as `30m`, `6h` or `disabled`.
    Interval {
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the command ran but reported a failure.
async fn run(cli: Cli) -> Result<bool> {
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Init { output } => cmd_init(&output).map(|_| true),
        Commands::Validate => cmd_validate(&config_path),
        Commands::Interval { value } => Ok(cmd_interval(&value)),
        Commands::Providers => {
            let config = load_config(&config_path)?;
            cmd_providers(&config).map(|_| true)
        }
        Commands::Sync { provider } => {
            let config = load_config(&config_path)?;
            cmd_sync(&config, provider.as_deref()).await
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn resolve_config_path(arg: Option<&str>) -> PathBuf {
    match arg {
        Some(path) => expand_tilde(path),
        None => dirs::config_dir()
            .map(|dir| dir.join("shelfsync").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("shelfsync.toml")),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let path = config.daemon.database_path();
    Database::open(&path).with_context(|| format!("failed to open database {}", path.display()))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# shelfsync configuration

[daemon]
log_level = "info"
data_dir = "/var/lib/shelfsync"
# log_dir = "/var/log/shelfsync"
# Used until an interval is stored via the API. "disabled", or e.g. "30m", "6h".
refresh_interval = "disabled"

[web]
listen = "127.0.0.1:3000"

[providers.audiobookshelf]
url = "https://abs.example.com"
token_env = "ABS_TOKEN"
# Leave empty to sync every book library on the server.
library_ids = []
page_size = 1000
# request_timeout_secs = 60
# connect_timeout_secs = 10

[providers.calibre]
library_path = "/srv/calibre"
page_size = 1000
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point the provider sections at your libraries (remove any you don't use)");
    println!("  2. Export the Audiobookshelf API token as ABS_TOKEN");
    println!(
        "  3. Validate with: shelfsync validate --config {}",
        output.display()
    );
    println!(
        "  4. Start the daemon: shelfsync-daemon --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<bool> {
    println!(
        "{}",
        style::header(&format!("Validating configuration: {}", config_path.display()))
    );
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        return Ok(false);
    }
    println!("  {}", style::success("All required fields are valid"));

    println!();
    println!("Configuration summary:");
    println!("  Web listen       : {}", config.web.listen);
    println!("  Data directory   : {}", config.daemon.data_dir.display());
    println!("  Default interval : {}", config.daemon.refresh_interval);
    match config.providers.audiobookshelf {
        Some(ref abs) => {
            println!("  Audiobookshelf   : {}", abs.url);
            if abs.token.is_none() {
                println!(
                    "  {}",
                    style::warn(&format!("{} is not set; provider disabled", abs.token_env))
                );
            }
        }
        None => println!("  Audiobookshelf   : {}", style::dim("not configured")),
    }
    match config.providers.calibre {
        Some(ref calibre) => {
            println!("  Calibre          : {}", calibre.library_path.display());
            if !calibre.library_path.join("metadata.db").exists() {
                println!(
                    "  {}",
                    style::warn("metadata.db not found; provider disabled")
                );
            }
        }
        None => println!("  Calibre          : {}", style::dim("not configured")),
    }
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(true)
}

fn cmd_providers(config: &AppConfig) -> Result<()> {
    let registry =
        ProviderRegistry::from_config(&config.providers).context("failed to build providers")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Provider", "Status"]);
    for provider in registry.all() {
        table.add_row(vec![
            Cell::new(provider.provider_name()),
            Cell::new(style::configured(provider.is_configured())),
        ]);
    }

    println!("{table}");
    if registry.available().is_empty() {
        println!();
        println!("{}", style::warn("No providers are configured."));
    }
    Ok(())
}

async fn cmd_sync(config: &AppConfig, only: Option<&str>) -> Result<bool> {
    let db = Arc::new(open_database(config)?);
    let registry =
        ProviderRegistry::from_config(&config.providers).context("failed to build providers")?;
    let status = SyncStatusRegistry::spawn(Arc::new(BroadcastChannel::new()));
    let engine = SyncEngine::new(registry, db, status);

    let (summaries, failures) = match only {
        Some(name) => {
            println!("Syncing {}...", name);
            let outcome = engine.run_provider(name).await?;
            let failures: Vec<String> = outcome.failure.into_iter().collect();
            (vec![outcome.summary], failures)
        }
        None => {
            println!("Syncing all configured providers...");
            let report = engine.run_all().await;
            let mut failures: Vec<String> = report
                .failed_providers
                .iter()
                .map(|name| format!("{name}: pass ended early"))
                .collect();
            for provider in engine.providers().available() {
                let name = provider.provider_name();
                if report.providers.iter().any(|s| s.provider == name) {
                    continue;
                }
                let prefix = format!("{name}: ");
                failures.push(
                    report
                        .errors
                        .iter()
                        .find(|e| e.starts_with(&prefix))
                        .cloned()
                        .unwrap_or_else(|| format!("{name}: pass did not start")),
                );
            }
            (report.providers, failures)
        }
    };
    println!();

    if summaries.is_empty() && failures.is_empty() {
        println!("{}", style::warn("No providers are configured."));
        return Ok(true);
    }

    println!("{}", summary_table(&summaries));

    for summary in &summaries {
        for error in &summary.errors {
            println!(
                "  {}",
                style::dim(&format!("{}: {}", summary.provider, error))
            );
        }
    }

    if failures.is_empty() {
        println!();
        println!("{}", style::success("Sync completed."));
        Ok(true)
    } else {
        println!();
        for failure in &failures {
            println!("{}", style::error(failure));
        }
        Ok(false)
    }
}

fn summary_table(summaries: &[PassSummary]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Provider", "Books", "New", "Duplicates", "Errors"]);
    for s in summaries {
        table.add_row(vec![
            Cell::new(&s.provider),
            Cell::new(s.total_books),
            Cell::new(s.new_books),
            Cell::new(s.duplicate_memberships),
            Cell::new(s.errors.len()),
        ]);
    }
    table
}

fn cmd_interval(value: &str) -> bool {
    match RefreshInterval::parse(value) {
        Ok(RefreshInterval::Disabled) => {
            println!("{}", style::success("Scheduled refresh disabled"));
            true
        }
        Ok(interval) => {
            let minutes = interval.period().map(|p| p.as_secs() / 60).unwrap_or(0);
            println!(
                "{}",
                style::success(&format!("{} = every {} minute(s)", interval, minutes))
            );
            true
        }
        Err(e) => {
            println!("{}", style::error(&e.to_string()));
            false
        }
    }
}
