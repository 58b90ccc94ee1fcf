//! Content fingerprints
//!
//! A fingerprint is a 128-bit digest of a file's bytes only. Name, size and
//! timestamps never contribute, so identical content always compares equal.

use crate::error::SyncError;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Fingerprint {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SyncError::Protocol(format!("invalid fingerprint {:?}", s)));
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| SyncError::Protocol(format!("invalid fingerprint {:?}: {}", s, e)))?;
        }
        Ok(Self(out))
    }
}

/// Source of content fingerprints. Implementations must be deterministic and
/// look at nothing but the bytes they are given.
pub trait FingerprintProvider: Send + Sync {
    fn fingerprint_reader(&self, reader: &mut dyn Read) -> io::Result<Fingerprint>;

    fn fingerprint_file(&self, path: &Path) -> io::Result<Fingerprint> {
        let mut reader = BufReader::new(File::open(path)?);
        self.fingerprint_reader(&mut reader)
    }
}

/// MD5 digest, streamed; the same fingerprint the C peers compute.
#[derive(Debug, Default, Clone, Copy)]
pub struct Md5Provider;

impl FingerprintProvider for Md5Provider {
    fn fingerprint_reader(&self, reader: &mut dyn Read) -> io::Result<Fingerprint> {
        let mut ctx = md5::Context::new();
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            ctx.consume(&buf[..n]);
        }
        Ok(Fingerprint(ctx.compute().0))
    }
}

pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    Fingerprint(md5::compute(data).0)
}
