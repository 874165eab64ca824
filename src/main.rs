use anyhow::{Context, Result};
use clap::Parser;
use http_test_server::config::Config;
use http_test_server::server::{shutdown_signal, Server};
use http_test_server::summary::{self, Parameters};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("http_test_server={},tower_http={}", config.log_level, config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Server is starting...");

    summary::remove_stale(&config.summary_path)
        .with_context(|| format!("failed to remove stale summary {}", config.summary_path.display()))?;

    let server_config = config.server_config().context("invalid configuration")?;
    tracing::info!(
        address = %server_config.address,
        latency = ?server_config.latency.distribution(),
        rate_limit = ?server_config.rate_limit.behavior,
        "Configuration loaded"
    );

    if let Some(path) = &config.parameters_path {
        summary::write_json(path, &Parameters::from(&server_config))
            .with_context(|| format!("failed to write parameters to {}", path.display()))?;
        tracing::info!("Wrote test parameters to {}", path.display());
    }

    let server = Server::new(server_config).context("failed to create server")?;
    let statistics = server
        .run(shutdown_signal(), config.shutdown_timeout)
        .await
        .context("server error")?;

    summary::write_json(&config.summary_path, &statistics)
        .with_context(|| format!("failed to write summary to {}", config.summary_path.display()))?;
    tracing::info!("Wrote activity summary to {}", config.summary_path.display());

    Ok(())
}
