mod relay;

use anyhow::Result;
use clap::Parser;
use relay::RelayConfig;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "vigil-hub", about = "Broadcast relay for vigil peers")]
struct Args {
    /// Socket path; defaults to the user runtime dir (or /tmp) + vigil/hub.sock
    #[arg(long, default_value = "")]
    socket: String,

    /// Frames buffered per connection before the oldest are dropped
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,

    /// Per-frame write timeout in seconds
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
}

fn resolve_socket(arg: &str) -> PathBuf {
    if !arg.is_empty() {
        return PathBuf::from(arg);
    }
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vigil")
        .join("hub.sock")
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = RelayConfig {
        socket_path: resolve_socket(&args.socket),
        queue_capacity: args.queue_capacity.max(1),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = relay::run(config, shutdown_rx).await {
        error!(event = "relay_error", error = %err);
        return Err(err.into());
    }
    Ok(())
}
