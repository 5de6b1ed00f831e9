//! Tether server binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve the built-in monitor app on localhost
//! tether-server --bind 127.0.0.1:7070
//!
//! # Resolve remote asset references against ./assets
//! tether-server --bind 0.0.0.0:7070 --asset-dir ./assets
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tether_server::{
    DriverConfig, MONITOR_APP_NAME, ManagerConfig, MonitorApp, Server, ServerRuntimeConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tether host/remote mirror server
#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "Host/remote mirror session server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    bind: String,

    /// Directory that remote asset references resolve against
    #[arg(long)]
    asset_dir: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Seconds a created session waits for its peer before it is reaped
    #[arg(long, default_value = "30")]
    pending_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Tether server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        asset_dir: args.asset_dir,
        driver: DriverConfig {
            max_connections: args.max_connections,
            manager: ManagerConfig {
                pending_timeout: Duration::from_secs(args.pending_timeout_secs),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };

    let mut server = Server::bind(config).await?;
    server.driver_mut().register_app(MONITOR_APP_NAME, MonitorApp::new("tether monitor"))?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
