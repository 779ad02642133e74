use clap::Parser;
use nsmd::config::Cli;
use nsmd::daemon::DaemonService;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config()?;

    tracing::info!("Starting daemon on {}:{}", config.ip, config.port);
    tracing::info!("Priority {}, registry key {}", config.priority, config.shm_key());
    if !config.seeds.is_empty() {
        tracing::info!("Seed daemons: {:?}", config.seeds);
    }

    let service = DaemonService::bind(&config).await?;
    tracing::info!("Press Ctrl+C to shutdown");
    service.run().await
}
