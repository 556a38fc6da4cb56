use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use we0_index::config::Settings;
use we0_index::server;
use we0_index::service::IndexService;

#[derive(Debug, Parser)]
#[command(name = "we0-index")]
#[command(version)]
#[command(about = "Syntax-aware repository indexing for semantic code retrieval")]
struct Cli {
    /// Path to the YAML settings file.
    #[arg(long, short = 'c', default_value = "we0-index.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP service (the default when no subcommand is given).
    Serve,
    /// Print the resolved settings and exit.
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Bootstrap failures (missing/malformed settings) exit non-zero before
    // any server state exists.
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;

    let _log_guard = init_tracing(&settings);

    match cli.cmd.unwrap_or(Command::Serve) {
        Command::PrintConfig => {
            println!("{}", serde_yaml::to_string(&settings)?);
            Ok(())
        }
        Command::Serve => {
            let service = IndexService::init(&settings)
                .await
                .context("failed to initialize the index service")?;
            server::serve(&settings, service).await?;
            Ok(())
        }
    }
}

fn init_tracing(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));

    let stdout_layer = tracing_subscriber::fmt::layer();

    if settings.log.file {
        let appender = tracing_appender::rolling::daily("log", "we0-index.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        None
    }
}
