#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ct_core::keys;
use ct_core::sth::GetRootsResponse;
use ct_submit::chain::RootPool;
use ct_submit::committer;
use ct_submit::config::KvDir;
use ct_submit::lock::{acquire_leadership, spawn_watchdog, LeaderGate, SledLease};
use ct_submit::metrics::Metrics;
use ct_submit::sequencer::{self, SequencerConfig};
use ct_submit::server::{router, AppState};
use ct_submit::stage0::StageZero;

/// Lease duration; the watchdog renews at a third of this.
const LEASE_MS: u64 = 15_000;

#[derive(Parser, Debug)]
#[command(author, version, about = "CT log writer")]
struct Args {
    /// Directory holding config.json and the leader lease.
    #[arg(long, env = "ITKO_KV_PATH")]
    kv_path: String,

    /// IP and port to listen on for incoming connections.
    #[arg(long, env = "ITKO_LISTEN_ADDRESS")]
    listen_address: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()).await {
        error!(error = %err, "writer terminated");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let kv = KvDir::new(&args.kv_path);
    let config = kv.load_config().map_err(|e| e.to_string())?;
    config.validate().map_err(|e| e.to_string())?;

    // Single-writer election comes first; everything after assumes we are
    // the only sequencer for this log.
    let holder_id = format!(
        "{}:{}",
        hostname(),
        std::process::id()
    );
    let gate: Arc<dyn LeaderGate> =
        Arc::new(SledLease::open(kv.lock_path(), holder_id, LEASE_MS).map_err(|e| e.to_string())?);
    acquire_leadership(gate.as_ref(), Duration::from_secs(1))
        .await
        .map_err(|e| e.to_string())?;
    let _watchdog = spawn_watchdog(Arc::clone(&gate), Duration::from_millis(LEASE_MS / 3));

    let signer = config.load_signer().map_err(|e| e.to_string())?;
    let store = config.build_store().map_err(|e| e.to_string())?;

    // Accepted roots are parsed once at boot.
    let roots_json = store
        .get(keys::ROOTS)
        .await
        .map_err(|e| format!("unable to fetch roots: {e}"))?;
    let roots: GetRootsResponse =
        serde_json::from_slice(&roots_json).map_err(|e| format!("unable to parse roots: {e}"))?;
    let pool = RootPool::new(roots.certificates).map_err(|e| e.to_string())?;

    let metrics = Metrics::new();
    let mut committer = committer::boot(
        Arc::clone(&store),
        signer.clone(),
        config.name.clone(),
        config.mask_size,
        metrics.clone(),
    )
    .await
    .map_err(|e| format!("boot failed: {e}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (submit_tx, batch_rx, sequencer_handle) = sequencer::spawn(
        committer.tree_size(),
        SequencerConfig {
            flush_interval: Duration::from_millis(config.flush_ms),
        },
        shutdown_rx,
    );

    let stage0 = Arc::new(StageZero {
        roots: pool,
        policy: config.acceptance_policy().map_err(|e| e.to_string())?,
        signer,
        store: Arc::clone(&store),
        mask: config.mask_size,
        to_sequencer: submit_tx,
        metrics: metrics.clone(),
    });

    // Stage 2 runs to completion; its first error ends the process.
    let gate_for_commit = Arc::clone(&gate);
    let committer_handle = tokio::spawn(async move {
        if let Err(e) = committer.run(batch_rx).await {
            error!(error = %e, "commit failed; releasing lease and exiting");
            let _ = gate_for_commit.release();
            std::process::exit(1);
        }
    });

    let listen = args
        .listen_address
        .unwrap_or_else(|| config.listen_address.clone());
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid listen address {listen:?}: {e}"))?;
    let app = router(AppState {
        stage0,
        metrics,
    });
    info!(%addr, name = %config.name, "itko-submit listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| e.to_string())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| e.to_string())?;

    // Drain the pipeline: final flush, final commit, release the lease.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = sequencer_handle.await;
    let _ = committer_handle.await;
    gate.release().map_err(|e| e.to_string())?;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "itko-submit".to_string())
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
