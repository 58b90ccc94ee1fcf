use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dirsync::cli::{init_tracing, DaemonOpts};
use dirsync::net_async::server::{serve, ServerContext};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    // Validate root directory exists and is a directory
    if !opts.root.exists() {
        anyhow::bail!("Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", opts.root.display());
    }
    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;
    let config = opts.sync_config()?;

    println!("Starting dirsync daemon:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", opts.bind);
    println!("  Chunk size: {} bytes", config.chunk_size);
    if opts.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: binding to 0.0.0.0 exposes the directory on all interfaces, unauthenticated");
    }
    info!(?config, "daemon configuration");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(serve(&opts.bind, ServerContext::new(canonical_root, config)))
}
