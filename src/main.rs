//! accel-mem: accelerator memory manager.
//!
//! Starts the memory runtime over the native backend (or a simulated one) and
//! serves its usage snapshots, cache state and Prometheus metrics over HTTP.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use accel_mem::config::{Cli, Config};
use accel_mem::metrics::Metrics;
use accel_mem::native::sim::SimulatedAccelerator;
use accel_mem::native::NativeApi;
use accel_mem::server::api::{build_router, AppState};
use accel_mem::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "accel_mem=debug,tower_http=debug"
    } else {
        "accel_mem=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("accel-mem v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen.clone() {
        config.server.listen = listen;
    }

    info!(
        high_watermark = config.memory.high_watermark,
        max_retries = config.memory.max_retries,
        contexts_per_device = config.devices.contexts_per_device,
        conservative = config.eviction.conservative,
        "Configuration loaded"
    );

    let native = select_backend(&cli);
    let runtime = Arc::new(Runtime::new(config.clone(), native)?);

    for device in runtime.devices() {
        info!(
            device = device.id,
            name = %device.name,
            total_memory = device.total_memory,
            threshold = runtime.snapshot(device.id)?.threshold_bytes,
            "Device ready"
        );
    }

    // Build application state.
    let state = Arc::new(AppState {
        runtime: runtime.clone(),
        metrics: Metrics::new()?,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen;
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    runtime.shutdown();
    Ok(())
}

/// Simulated devices when requested, otherwise the native driver.
fn select_backend(cli: &Cli) -> Arc<dyn NativeApi> {
    if let Some(count) = cli.simulate_devices {
        info!(count, capacity = cli.device_memory, "Using simulated accelerator");
        return Arc::new(SimulatedAccelerator::uniform(count, cli.device_memory as u64));
    }

    #[cfg(feature = "cuda")]
    match accel_mem::native::cuda::CudaBackend::new() {
        Ok(backend) => return Arc::new(backend),
        Err(err) => warn!(error = %err, "CUDA backend unavailable"),
    }

    warn!("No accelerator backend available, running in CPU-only mode");
    Arc::new(SimulatedAccelerator::uniform(0, 0))
}
