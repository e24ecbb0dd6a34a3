#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ct_monitor::handlers::{router, AppState};
use ct_monitor::metrics::Metrics;
use ct_monitor::Monitor;
use ct_store::{FsStore, HttpStore, Storage};

#[derive(Parser, Debug)]
#[command(author, version, about = "CT log monitor")]
struct Args {
    /// Tile storage url. Must end with a trailing slash.
    #[arg(long, env = "ITKO_STORE_ADDRESS", conflicts_with = "store_directory")]
    store_address: Option<String>,

    /// Serve tiles from a local directory instead of a url.
    #[arg(long, env = "ITKO_STORE_DIRECTORY")]
    store_directory: Option<String>,

    /// Hex-character prefix length of the index files.
    #[arg(long, env = "ITKO_MASK_SIZE")]
    mask_size: usize,

    /// IP and port to listen on for incoming connections.
    #[arg(long, env = "ITKO_LISTEN_ADDRESS")]
    listen_address: String,

    /// Cap on entries per get-entries response.
    #[arg(long, default_value_t = 1000)]
    max_batch: u64,

    /// Cap on storage fetches a single get-entries request may spend.
    #[arg(long, default_value_t = 2048)]
    fetch_budget: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()).await {
        error!(error = %err, "monitor terminated");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let store: Arc<dyn Storage> = match (&args.store_address, &args.store_directory) {
        (Some(url), None) => Arc::new(HttpStore::new(url.clone()).map_err(|e| e.to_string())?),
        (None, Some(dir)) => Arc::new(FsStore::new(dir)),
        _ => return Err("exactly one of --store-address or --store-directory is required".into()),
    };

    let monitor = Monitor {
        store,
        mask: args.mask_size,
        max_batch: args.max_batch,
        fetch_budget: args.fetch_budget,
    };

    let addr: SocketAddr = args
        .listen_address
        .parse()
        .map_err(|e| format!("invalid listen address {:?}: {e}", args.listen_address))?;
    info!(%addr, "itko-monitor listening");

    let app = router(AppState {
        monitor,
        metrics: Metrics::new(),
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| e.to_string())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| e.to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
