//! Shared protocol constants for the dirsync framed transport

use std::fmt;

/// Header: TYPE (4, big-endian) | LENGTH (4, big-endian)
pub const HEADER_LEN: usize = 8;

pub const DEFAULT_PORT: u16 = 8080;

/// Nominal FILE_DATA payload size, the 4 KiB buffer the framed C peers use.
/// A chunk shorter than this ends a transfer.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Maximum filenames a client holds between DIFF and PULL
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

// Upper bound on any single payload (1MB) - oversize frames are rejected
// instead of allocated
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

pub const MAX_FILENAME_LEN: usize = 255;

/// RESPONSE text sent instead of file data when a PULL target is absent
pub const NOT_FOUND_MARKER: &str = "FILE_NOT_FOUND";

/// LIST reply when the server root cannot be read
pub const LIST_UNAVAILABLE: &str = "Unable to open directory.\n";

/// Last LIST line when the listing did not fit in one payload
pub const LIST_TRUNCATED_MARKER: &str = "... (listing truncated)\n";

/// Message type IDs (numeric values stable with existing C peers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    List = 1,
    Diff = 2,
    Pull = 3,
    Leave = 4,
    Filename = 5,
    Fingerprint = 6,
    FileData = 7,
    Response = 8,
    Done = 9,
}

impl MsgType {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::List,
            2 => Self::Diff,
            3 => Self::Pull,
            4 => Self::Leave,
            5 => Self::Filename,
            6 => Self::Fingerprint,
            7 => Self::FileData,
            8 => Self::Response,
            9 => Self::Done,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::List => "LIST",
            Self::Diff => "DIFF",
            Self::Pull => "PULL",
            Self::Leave => "LEAVE",
            Self::Filename => "FILENAME",
            Self::Fingerprint => "FINGERPRINT",
            Self::FileData => "FILE_DATA",
            Self::Response => "RESPONSE",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub mod timeouts {
    /// How long a receiver waits for a trailing DONE after a short chunk (ms)
    pub const DONE_GRACE_MS: u64 = 200;
}
