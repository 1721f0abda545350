#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use clap::Parser;
use config::{CliArgs, Command, GenerateConfig};
use microdb::{
    CsvStore, Schema,
    pipeline::{RandomInventory, run_pipeline},
    server::{Server, ServerConfig, bind},
};
use telemetry::init_telemetry;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let providers = init_telemetry()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = match args.command {
        Command::Serve(args) => serve(ServerConfig::try_from(args)?, shutdown).await,
        Command::Generate(args) => generate(GenerateConfig::try_from(args)?, shutdown).await,
    };

    if let Err(e) = &result {
        tracing::error!("{e:#}");
    }
    providers.shutdown();
    result
}

async fn serve(config: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    if cfg!(debug_assertions) {
        tracing::info!("Starting record server with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting record server on {} backed by {}",
            config.addr,
            config.store_path.display()
        );
    }

    let server = Server::open(&config)?;
    let listener = bind(config.addr, config.backlog)?;
    server.serve(listener, shutdown).await?;
    Ok(())
}

async fn generate(config: GenerateConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!(
        "Generating {} records with {} workers into {}",
        config.pipeline.total_records,
        config.pipeline.workers,
        config.output.display()
    );

    let report = tokio::task::spawn_blocking(move || {
        let store = CsvStore::create(&config.output, Schema::generated())?;
        run_pipeline(&config.pipeline, store, |_| RandomInventory::new(), &shutdown)
    })
    .await??;

    for worker in &report.workers {
        tracing::debug!("{worker:?}");
    }
    if report.cancelled {
        tracing::warn!("Generation interrupted");
    }
    println!("Records written: {}/{}", report.written, report.total);
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    shutdown.cancel();
}
