//! netguard server binary.
//!
//! ```text
//! load config → logging/metrics → monitor (restore checkpoint, housekeeping)
//!     → connection service (echo handler) → Ctrl+C
//!     → service shutdown → housekeeping shutdown → save checkpoint
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use netguard::config::{load_config, ServiceConfig};
use netguard::lifecycle::signals::shutdown_signal;
use netguard::monitor::{checkpoint, IpAddressRequestMonitor};
use netguard::net::IoPool;
use netguard::observability::{logging, metrics};
use netguard::service::{ConnectionService, EchoHandler};

#[derive(Parser)]
#[command(name = "netguard")]
#[command(about = "TCP request server with per-IP abuse monitoring", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides server.port.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.io_threads.max(1))
        .thread_name("netguard-io")
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(&config.observability.log_filter);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "netguard starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(error) = metrics::init_metrics(addr) {
                    tracing::error!(error = %error, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let monitor = Arc::new(IpAddressRequestMonitor::new(&config.monitor));
    if let Some(dir) = &config.monitor.checkpoint_dir {
        if checkpoint::checkpoint_path(dir).exists() {
            let restored = monitor.restore_from_checkpoint(dir)?;
            tracing::info!(restored, dir = %dir.display(), "Checkpoint restored");
        }
    }
    monitor.start_housekeeping()?;

    let service = ConnectionService::new(
        config.server.clone(),
        &config.client_io,
        Arc::clone(&monitor),
        Arc::new(EchoHandler),
        IoPool::current(),
    );
    let local_addr = service.start(config.server.port)?;
    tracing::info!(address = %local_addr, "Listening for connections");

    shutdown_signal().await;

    service.shutdown(config.server.shutdown_timeout()).await;
    monitor.shutdown_housekeeping().await;

    if let Some(dir) = &config.monitor.checkpoint_dir {
        std::fs::create_dir_all(dir)?;
        let saved = monitor.save_checkpoint(dir)?;
        tracing::info!(saved, dir = %dir.display(), "Checkpoint saved");
    }

    tracing::info!(
        service = %serde_json::to_string(&service.metrics())?,
        monitor = %serde_json::to_string(&monitor.metrics())?,
        "Final metrics"
    );
    tracing::info!("Shutdown complete");
    Ok(())
}
