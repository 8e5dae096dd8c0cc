use clap::Parser;
use tokio_util::sync::CancellationToken;
use volley::{telemetry, AdapterRegistry, Config, Dispatcher, EngineConfig, Pipeline, PipelineConfig};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, finishing the current drain before exiting...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, finishing the current drain before exiting...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = volley::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    let registry = AdapterRegistry::from_config(&config.destinations)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    tracing::debug!("{:?}", args);
    if registry.is_empty() {
        tracing::warn!("No destinations configured, every batch will be rejected");
    } else {
        tracing::info!(destinations = ?registry.tags(), "Registered destinations");
    }

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            stop.cancel();
        }
    });

    let dispatcher = Dispatcher::new(registry, EngineConfig::from(&config));
    let mut pipeline = Pipeline::new(PipelineConfig::from_config(&config, args.once), dispatcher);
    let stats = pipeline.run(stop).await?;

    tracing::info!(
        archived = stats.archived,
        rejected = stats.rejected,
        failed = stats.failed,
        "Exiting"
    );
    Ok(())
}
