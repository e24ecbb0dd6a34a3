#![forbid(unsafe_code)]

//! Seeds a fresh log: accepted roots, config blob, and the size-zero
//! tree head.

use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ct_submit::config::{GlobalConfig, KvDir};
use ct_submit::setup;

#[derive(Parser, Debug)]
#[command(author, version, about = "CT log initializer")]
struct Args {
    /// Directory that will hold config.json and the leader lease.
    #[arg(long, env = "ITKO_KV_PATH")]
    kv_path: String,

    /// Log configuration JSON to install.
    #[arg(long)]
    config: PathBuf,

    /// PEM bundle of accepted root certificates.
    #[arg(long)]
    roots: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!(error = %err, "setup failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let config = GlobalConfig::load(&args.config).map_err(|e| e.to_string())?;
    let store = config.build_store().map_err(|e| e.to_string())?;
    let kv = KvDir::new(&args.kv_path);
    setup::run(&kv, &config, &args.roots, store)
        .await
        .map_err(|e| e.to_string())
}
