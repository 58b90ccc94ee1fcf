//! Error taxonomy for the sync protocol

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Peer closed the connection cleanly on a frame boundary
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// Peer closed the connection part way through a frame
    #[error("connection closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("missing-file cache full ({capacity} entries), dropped {name}")]
    CacheCapacityExceeded { capacity: usize, name: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// The connection is gone; the session or client run must end.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Truncated { .. } | Self::Connection(_)
        )
    }

    /// Closed on a frame boundary, so nothing was lost in flight.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
