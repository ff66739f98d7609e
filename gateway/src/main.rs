mod config;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use query_router::config::ValidationError;
use query_router::errors::QueryRouterError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "query_router";

#[derive(Parser)]
#[command(name = "query-gateway", about = "Authorizing gateway in front of the query adapter")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the query router
    QueryRouter(ConfigArgs),
    /// Parse and validate a config file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid query_router config: {0}")]
    Validation(#[from] ValidationError),
    #[error("missing `{0}` section in config")]
    MissingSection(&'static str),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    QueryRouter(#[from] QueryRouterError),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::QueryRouter(args) => {
            let config = Config::from_file(&args.config_file)?;
            let _sentry = init_logging(config.common.logging.as_ref());
            if let Some(metrics_config) = &config.common.metrics {
                init_metrics(metrics_config)?;
            }

            let router_config = config
                .query_router
                .ok_or(CliError::MissingSection("query_router"))?;

            tracing::info!(
                host = %router_config.listener.host,
                port = router_config.listener.port,
                "Starting query router"
            );
            query_router::run(router_config).await?;
        }
        CliCommand::CheckConfig(args) => {
            let config = Config::from_file(&args.config_file)?;
            config
                .query_router
                .as_ref()
                .ok_or(CliError::MissingSection("query_router"))?
                .validate()?;
            println!("{} is valid", args.config_file.display());
        }
    }

    Ok(())
}

/// Installs the global subscriber. The returned guard flushes pending sentry
/// events when dropped and has to outlive the service.
fn init_logging(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = config.map_or("info", |c| c.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let sentry_guard = config.and_then(|c| c.sentry_dsn.as_deref()).map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = sentry_guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    sentry_guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(query_router::metrics_defs::ALL_METRICS);
    tracing::info!(host = %config.statsd_host, port = config.statsd_port, "Metrics enabled");
    Ok(())
}
