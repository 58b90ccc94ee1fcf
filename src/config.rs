//! Protocol tunables shared by client and daemon
//!
//! Values come from defaults, optionally overridden by a TOML file; command
//! line flags are applied on top by the binaries.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    timeouts::DONE_GRACE_MS, DEFAULT_CACHE_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Nominal FILE_DATA payload size; both peers must agree on it
    pub chunk_size: usize,
    /// Maximum filenames held between DIFF and PULL
    pub cache_capacity: usize,
    /// Largest payload accepted from the peer
    pub max_payload: usize,
    /// Wait for a trailing DONE after a short chunk (ms)
    pub done_grace_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            done_grace_ms: DONE_GRACE_MS,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: SyncConfig =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults when no file is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be greater than 0");
        }
        if self.max_payload > u32::MAX as usize {
            bail!("max_payload {} exceeds the 32-bit length field", self.max_payload);
        }
        if self.chunk_size > self.max_payload {
            bail!(
                "chunk_size {} exceeds max_payload {}",
                self.chunk_size,
                self.max_payload
            );
        }
        Ok(())
    }

    pub fn done_grace(&self) -> Duration {
        Duration::from_millis(self.done_grace_ms)
    }
}
