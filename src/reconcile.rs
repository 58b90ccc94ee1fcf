//! DIFF: content-addressed reconciliation
//!
//! Client -> Server: DIFF, one FINGERPRINT per local file (no names), DONE.
//! Server -> Client: one RESPONSE per server file whose fingerprint the client
//! did not send, then DONE.
//!
//! Membership is by content only. A server file is reported exactly when no
//! client file anywhere in the directory has the same bytes, whatever it is
//! called.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use crate::frame::{read_message, write_empty, write_text};
use crate::fs_enum::FileFingerprint;
use crate::missing_set::{InsertOutcome, MissingSet};
use crate::protocol::MsgType;
use crate::protocol_core::{decode_text, validate_flat_name};

/// Result of one DIFF round as seen by the client
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffReport {
    /// Every filename the server reported, in report order
    pub reported: Vec<String>,
    /// Reported again while already cached
    pub duplicates: Vec<String>,
    /// Rejected because the missing-file cache was full
    pub dropped: Vec<String>,
    /// Names that are not safe flat filenames
    pub invalid: Vec<String>,
}

impl DiffReport {
    pub fn capacity_exceeded(&self) -> bool {
        !self.dropped.is_empty()
    }
}

pub async fn send_fingerprints<W>(writer: &mut W, entries: &[FileFingerprint]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for entry in entries {
        debug!("fingerprint {} {}", entry.fingerprint, entry.name);
        write_text(writer, MsgType::Fingerprint, &entry.fingerprint.to_hex()).await?;
    }
    write_empty(writer, MsgType::Done).await
}

/// Read RESPONSE frames until DONE, caching each name. When the cache fills
/// up the remaining names are still read (and dropped) so the round ends on
/// its DONE.
pub async fn receive_report<R>(
    reader: &mut R,
    missing: &mut MissingSet,
    max_payload: usize,
) -> Result<DiffReport>
where
    R: AsyncRead + Unpin,
{
    let mut report = DiffReport::default();
    loop {
        let frame = match read_message(reader, max_payload).await {
            Ok(f) => f,
            Err(e) if !e.is_fatal() => {
                warn!("skipping bad DIFF response: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        match frame.kind() {
            Some(MsgType::Done) => break,
            Some(MsgType::Response) => {
                let name = match decode_text(&frame.payload) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("skipping undecodable filename: {}", e);
                        report.invalid.push(String::from_utf8_lossy(&frame.payload).into_owned());
                        continue;
                    }
                };
                if let Err(e) = validate_flat_name(&name) {
                    warn!("ignoring reported name {:?}: {}", name, e);
                    report.invalid.push(name);
                    continue;
                }
                match missing.insert(&name) {
                    Ok(InsertOutcome::Added) => {}
                    Ok(InsertOutcome::Duplicate) => {
                        debug!("{} already cached, skipping", name);
                        report.duplicates.push(name.clone());
                    }
                    Err(SyncError::CacheCapacityExceeded { capacity, .. }) => {
                        warn!(
                            "missing-file cache full ({} entries), dropping {}",
                            capacity, name
                        );
                        report.dropped.push(name.clone());
                    }
                    Err(e) => return Err(e),
                }
                report.reported.push(name);
            }
            _ => {
                return Err(SyncError::Protocol(format!(
                    "unexpected {} during DIFF",
                    frame.describe()
                )))
            }
        }
    }
    Ok(report)
}

/// Server side: gather the client's fingerprints until DONE.
pub async fn collect_fingerprints<R>(reader: &mut R, max_payload: usize) -> Result<HashSet<Fingerprint>>
where
    R: AsyncRead + Unpin,
{
    let mut set = HashSet::new();
    loop {
        let frame = match read_message(reader, max_payload).await {
            Ok(f) => f,
            Err(e) if !e.is_fatal() => {
                warn!("skipping bad fingerprint frame: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        match frame.kind() {
            Some(MsgType::Done) => return Ok(set),
            Some(MsgType::Fingerprint) => {
                match decode_text(&frame.payload).and_then(|s| s.parse::<Fingerprint>()) {
                    Ok(fp) => {
                        set.insert(fp);
                    }
                    Err(e) => warn!("skipping malformed fingerprint: {}", e),
                }
            }
            _ => {
                return Err(SyncError::Protocol(format!(
                    "unexpected {} while collecting fingerprints",
                    frame.describe()
                )))
            }
        }
    }
}

/// Names of server files whose content the client does not hold, in
/// enumeration order, one entry per distinct name.
pub fn missing_names(server: &[FileFingerprint], client: &HashSet<Fingerprint>) -> Vec<String> {
    let mut seen = HashSet::new();
    server
        .iter()
        .filter(|e| !client.contains(&e.fingerprint))
        .filter(|e| seen.insert(e.name.as_str()))
        .map(|e| e.name.clone())
        .collect()
}

pub async fn send_report<W>(writer: &mut W, names: &[String]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for name in names {
        write_text(writer, MsgType::Response, name).await?;
    }
    write_empty(writer, MsgType::Done).await
}
