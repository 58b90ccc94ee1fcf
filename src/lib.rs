//! dirsync library
//!
//! Flat-directory synchronisation over a small framed TCP protocol: LIST the
//! server directory, DIFF it against local content fingerprints, then PULL
//! whatever is missing.

pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod fs_enum;
pub mod missing_set;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod reconcile;
pub mod transfer;

pub use error::{Result, SyncError};
