#![doc = include_str!("../README.md")]

mod cli;

use assetflow::{DEFAULT_PROBE_TIMEOUT, FetchEnv};
use clap::Parser;
use cli::config::{CliArgs, RunConfig};
use cli::telemetry::init_telemetry;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let env = FetchEnv::init(config.fetch.clone())?;
    if let Some(addr) = &config.probe_addr {
        env.connectivity()
            .spawn_probe(addr.clone(), config.probe_interval, DEFAULT_PROBE_TIMEOUT);
    }
    log_startup_info(&config);

    // Dropping the fetches cancels their subscriptions.
    let outcome = tokio::select! {
        res = cli::fetch::run_all(&env, &config) => res,
        () = shutdown_signal() => Err(anyhow::anyhow!("interrupted")),
    };

    env.shutdown().await;

    #[cfg(feature = "tracing")]
    {
        match &outcome {
            Ok(()) => tracing::info!("All fetches finished"),
            Err(e) => tracing::error!("Stopped: {:#}", e),
        }
    }

    providers.shutdown();
    outcome
}

fn log_startup_info(_config: &RunConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting fetch with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Fetching {} asset(s) with demand {:?}",
            _config.locators.len(),
            _config.demand
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {:?}", _e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, cancelling fetches...");
}
