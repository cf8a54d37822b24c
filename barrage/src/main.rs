use clap::Parser;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use barrage::{Benchmark, Config, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, draining in-flight requests...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, draining in-flight requests...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = barrage::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize telemetry (tracing + optional OpenTelemetry)
    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let benchmark = Benchmark::from_config(config.clone());

    let shutdown = benchmark.shutdown_token();
    let signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let progress_done = CancellationToken::new();
    let progress_task = tokio::spawn({
        let mut updates = WatchStream::new(benchmark.progress());
        let interval = config.status_log_interval;
        let done = progress_done.clone();
        async move {
            let Some(interval) = interval else { return };
            let mut last_logged = tokio::time::Instant::now();
            loop {
                let snapshot = tokio::select! {
                    _ = done.cancelled() => return,
                    update = updates.next() => match update {
                        Some(snapshot) => snapshot,
                        None => return,
                    },
                };
                if last_logged.elapsed() < interval {
                    continue;
                }
                last_logged = tokio::time::Instant::now();
                tracing::info!(
                    warmup = snapshot.warmup_records,
                    profiling = snapshot.profiling_records,
                    "Records processed"
                );
            }
        }
    });

    let result = benchmark.run().await;
    progress_done.cancel();
    signal_task.abort();
    let _ = progress_task.await;

    let outcome = result?;
    outcome.log_summary();
    outcome.write_exports(&config.output)?;

    telemetry::shutdown_telemetry();
    Ok(())
}
