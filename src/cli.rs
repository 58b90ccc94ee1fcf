//! Shared CLI helpers and small reusable Clap fragments

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::SyncConfig;

/// Options for the dirsyncd daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "dirsync daemon: serves a flat directory over TCP")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Root directory to serve
    #[arg(long, default_value = "server_files")]
    pub root: PathBuf,

    /// TOML file with protocol tunables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override chunk_size from the config file
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Options for the interactive dirsync client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "dirsync client: LIST, DIFF and PULL against a dirsyncd")]
pub struct ClientOpts {
    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: String,

    /// Local directory compared against and filled by PULL
    #[arg(long, default_value = "client_files")]
    pub dir: PathBuf,

    /// TOML file with protocol tunables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override chunk_size from the config file
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Override cache_capacity from the config file
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Show a progress bar during PULL
    #[arg(short, long)]
    pub progress: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Commands to run instead of prompting (e.g. `diff pull leave`)
    pub commands: Vec<String>,
}

impl DaemonOpts {
    pub fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        let mut cfg = SyncConfig::load_or_default(self.config.as_deref())?;
        if let Some(n) = self.chunk_size {
            cfg.chunk_size = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

impl ClientOpts {
    pub fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        let mut cfg = SyncConfig::load_or_default(self.config.as_deref())?;
        if let Some(n) = self.chunk_size {
            cfg.chunk_size = n;
        }
        if let Some(n) = self.cache_capacity {
            cfg.cache_capacity = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Log to stderr. `RUST_LOG` wins over the verbosity flag when set.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
