use clap::Parser;

use beacon_server::ServerConfig;
use beacon_store::EntityStore;

/// Live position sharing server.
#[derive(Parser)]
#[command(name = "beacon", version)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8090)]
    port: u16,

    /// Per-connection outbound queue size before frames are dropped.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Beacon server");

    let store = EntityStore::new();

    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        max_send_queue: args.max_send_queue,
    };
    let handle = beacon_server::start(config, store)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "Beacon server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}
