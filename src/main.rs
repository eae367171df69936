//! newsletterd
//!
//! Newsletter and campaign mail server.
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌──────────────────────────── generation ────────────────────────────┐
//!   │                                                                    │
//!   │  storage ─▶ queries ─▶ campaign / importer / scheduler ─▶ bounce   │
//!   │     │                        │                           update    │
//!   │     │                        ▼                                     │
//!   │     │                  messenger registry (email, postbacks)       │
//!   │     │                        │                                     │
//!   │     │                        ▼                                     │
//!   │     │                  HTTP listener (/health, /api/about)         │
//!   │     │                                                              │
//!   │  coordinator ◀── SIGHUP / SIGTERM / SIGINT / config watcher        │
//!   │     │                                                              │
//!   │     └─▶ shutdown: scheduler, listener, workers, messengers, storage│
//!   └────────────────────────────────────────────────────────────────────┘
//!                 reload ─▶ next generation      terminate ─▶ exit
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use newsletterd::config::loader::write_sample_config;
use newsletterd::config::{load_config, DbConfig};
use newsletterd::lifecycle::Supervisor;
use newsletterd::observability;
use newsletterd::storage::{install_database, upgrade_database, StorageError};

const DEFAULT_CONFIG: &str = "config.toml";

#[derive(Debug, Parser)]
#[command(name = "newsletterd", version, about = "Newsletter and campaign mail server")]
struct Cli {
    /// Path to the TOML config file. Without it, defaults plus
    /// NEWSLETTERD_* environment variables are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a sample config file and exit.
    #[arg(long, conflicts_with_all = ["install", "upgrade"])]
    new_config: bool,

    /// Install the database schema and exit.
    #[arg(long, conflicts_with = "upgrade")]
    install: bool,

    /// With --install, leave an existing schema untouched.
    #[arg(long, requires = "install")]
    idempotent: bool,

    /// Apply pending schema migrations and exit.
    #[arg(long)]
    upgrade: bool,

    /// Skip confirmation prompts.
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.new_config {
        let path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        return match write_sample_config(&path) {
            Ok(()) => {
                println!("wrote sample config to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    observability::init(&config.observability);

    if cli.install || cli.upgrade {
        let action = if cli.install { "install the schema into" } else { "upgrade" };
        if !cli.yes && !confirm(&format!("This will {} {}. Continue?", action, config.db.path)) {
            println!("aborted");
            return ExitCode::SUCCESS;
        }
        return maintenance(&cli, &config.db).await;
    }

    match Supervisor::new(cli.config.as_deref()).run().await {
        Ok(report) => {
            if !report.is_clean() {
                tracing::warn!(failures = report.failures.len(), "Exited after an unclean shutdown");
            }
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "newsletterd failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn maintenance(cli: &Cli, db: &DbConfig) -> ExitCode {
    let path = db.path.as_str();
    if cli.install {
        match install_database(db, cli.idempotent).await {
            Ok(()) => {
                tracing::info!(path, "Database installed");
                ExitCode::SUCCESS
            }
            Err(StorageError::AlreadyInstalled(version)) => {
                tracing::error!(path, version, "Database already installed, use --idempotent or --upgrade");
                ExitCode::FAILURE
            }
            Err(e) => {
                tracing::error!(path, error = %e, "Install failed");
                ExitCode::FAILURE
            }
        }
    } else {
        match upgrade_database(db).await {
            Ok(applied) if applied.is_empty() => {
                tracing::info!(path, "Database schema already current");
                ExitCode::SUCCESS
            }
            Ok(applied) => {
                tracing::info!(path, versions = ?applied, "Migrations applied");
                ExitCode::SUCCESS
            }
            Err(StorageError::NotInstalled) => {
                tracing::error!(path, "Database not installed, run with --install first");
                ExitCode::from(2)
            }
            Err(e) => {
                tracing::error!(path, error = %e, "Upgrade failed");
                ExitCode::FAILURE
            }
        }
    }
}

/// Ask a yes/no question on the terminal. Anything but `y`/`yes` is no.
fn confirm(question: &str) -> bool {
    print!("{} [y/N] ", question);
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
