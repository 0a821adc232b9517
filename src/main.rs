//! `loand`: runs the investor notification scheduler against the loan ledger.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loan_lifecycle::channel;
use loan_lifecycle::config::{Config, ConfigSource, LogFormat, LoggingConfig};
use loan_lifecycle::ledger::Ledger;
use loan_lifecycle::scheduler::NotificationScheduler;

#[derive(Parser, Debug)]
#[command(name = "loand", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, default_value = "loand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the notification scheduler until interrupted.
    Run,
    /// Run a single notification pass and exit.
    NotifyOnce,
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("Invalid log level: {}", logging.level))?,
    };

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, source) = Config::load(&cli.config)?;
    init_tracing(&config.logging)?;
    if source == ConfigSource::Defaults {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    let ledger = Ledger::open(&config.storage.path).with_context(|| {
        format!("Failed to open ledger at {}", config.storage.path.display())
    })?;
    let ledger = Arc::new(ledger);
    let mailer = channel::mailer_from_config(&config.email).context("Invalid email settings")?;
    // fail at startup on a bad payment provider even though only requests use it
    channel::payment_from_config(&config.payment).context("Invalid payment settings")?;

    let scheduler = Arc::new(NotificationScheduler::new(
        Arc::clone(&ledger),
        mailer,
        config.scheduler.interval(),
    ));
    let cancel = CancellationToken::new();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::NotifyOnce => {
            let report = tokio::task::spawn_blocking(move || scheduler.run_once(&cancel))
                .await
                .context("Notification pass panicked")??;
            println!(
                "pending: {}, sent: {}, failed: {}",
                report.pending, report.sent, report.failed
            );
        }
        Commands::Run => {
            let worker = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
            cancel.cancel();
            worker.await.context("Scheduler task panicked")?;
        }
    }

    ledger.flush().context("Failed to flush ledger")?;
    Ok(())
}
