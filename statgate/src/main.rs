mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use edge_proxy::errors::EdgeProxyError;
use edge_proxy::metrics_defs::ALL_METRICS;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "statgate";

#[derive(Parser)]
#[command(name = "statgate", about = "Caching edge proxy for an analytics backend")]
enum CliCommand {
    /// Run the proxy
    Proxy(CliArgs),
    /// Validate the config file and exit
    CheckConfig(CliArgs),
}

#[derive(Args, Debug)]
struct CliArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start metrics exporter: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Proxy(#[from] EdgeProxyError),
}

fn main() {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Proxy(args) => run_proxy(&args),
        CliCommand::CheckConfig(args) => check_config(&args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(args: &CliArgs) -> Result<Config, ConfigError> {
    Config::from_file(&args.config_file_path)?.resolve(|name| std::env::var(name).ok())
}

fn check_config(args: &CliArgs) -> Result<(), CliError> {
    let config = load_config(args)?;

    println!("Config OK: {}", args.config_file_path.display());
    let missing = config.proxy.upstream.missing_settings();
    if !missing.is_empty() {
        println!("Not configured: {}", missing.join(", "));
    }
    Ok(())
}

fn run_proxy(args: &CliArgs) -> Result<(), CliError> {
    let config = load_config(args)?;

    let _sentry_guard = init_logging(config.common.logging.as_ref());
    if let Some(metrics_config) = &config.common.metrics {
        init_metrics(metrics_config)?;
    }

    let missing = config.proxy.upstream.missing_settings();
    if !missing.is_empty() {
        tracing::warn!(
            missing = %missing.join(", "),
            "Upstream is not fully configured, dependent routes will answer 500"
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!("Starting proxy");
    runtime.block_on(edge_proxy::run(config.proxy))?;
    Ok(())
}

/// Installs the tracing subscriber. The returned guard keeps Sentry alive and
/// must be held until exit.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = logging.map_or("info", |l| l.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let sentry_guard = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = sentry_guard
        .is_some()
        .then(|| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    sentry_guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(ALL_METRICS);
    Ok(())
}
