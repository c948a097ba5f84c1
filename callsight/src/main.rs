mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "callsight", version, about = "AI call telemetry pipeline")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "callsight.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the ingestion API and run index maintenance
    Ingest,
    /// Run the governance sync loop against the config center
    Sync,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("config has no `{0}` section")]
    MissingSection(&'static str),

    #[error("could not set up metrics: {0}")]
    Metrics(String),

    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Ingest(#[from] log_ingest::IngestServerError),

    #[error(transparent)]
    Sync(#[from] config_sync::ConfigSyncError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Held for the lifetime of the process so queued events are flushed on exit.
    let _sentry = init_logging(&config.common);

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "callsight exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run(command: CliCommand, config: Config) -> Result<(), CliError> {
    init_metrics(&config.common)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        CliCommand::Ingest => {
            let ingest = config.ingest.ok_or(CliError::MissingSection("ingest"))?;
            tracing::info!("Starting ingest");
            runtime.block_on(log_ingest::run(ingest))?;
        }
        CliCommand::Sync => {
            let sync = config.sync.ok_or(CliError::MissingSection("sync"))?;
            tracing::info!("Starting sync");
            runtime.block_on(config_sync::run(sync))?;
        }
    }
    Ok(())
}

fn init_logging(common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let guard = common.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.is_some().then(|| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(metrics_config) = &common.metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(&metrics_config.statsd_host, metrics_config.statsd_port)
        .build(Some("callsight"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(call_log::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(log_ingest::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(config_sync::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics_config.statsd_host,
        port = metrics_config.statsd_port,
        "Reporting metrics to statsd"
    );
    Ok(())
}
