//! PULL: one-directional chunked file transfer
//!
//! Client -> Server: PULL (payload = filename)
//! Server -> Client: RESPONSE(not-found marker), or FILE_DATA* then DONE.
//!
//! Chunks are never acknowledged. The receiver ends a file on EITHER a DONE
//! or a FILE_DATA shorter than the nominal chunk size, because peers in the
//! wild use one convention or the other (or both).

use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::frame::{read_full, read_message, write_empty, write_message, write_text, Frame};
use crate::protocol::{MsgType, NOT_FOUND_MARKER};
use crate::protocol_core::{decode_text, resolve_under_root};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { bytes: u64, chunks: u64 },
    NotFound,
}

/// Which signal closed a received file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndSignal {
    /// DONE with no short chunk before it
    Done,
    /// Short chunk, then DONE within the grace period
    ShortChunkThenDone,
    /// Short chunk and no DONE yet; the sender may still send one later
    ShortChunk,
}

impl EndSignal {
    /// A late DONE for this file may still be in flight.
    pub fn done_owed(&self) -> bool {
        matches!(self, Self::ShortChunk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Received { bytes: u64, end: EndSignal },
    NotFound,
    /// Server answered with some other RESPONSE text
    Rejected(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    pub chunk_size: usize,
    pub max_payload: usize,
    /// Wait for a trailing DONE after a short chunk
    pub grace: Duration,
}

/// Stream `root/name` as FILE_DATA chunks followed by DONE. Anything that
/// cannot be served (unsafe name, absent, not a regular file, unopenable)
/// is answered with the not-found marker.
pub async fn send_file<W>(writer: &mut W, root: &Path, name: &str, chunk_size: usize) -> Result<SendOutcome>
where
    W: AsyncWrite + Unpin,
{
    let path = match resolve_under_root(root, name) {
        Ok(p) => p,
        Err(e) => {
            warn!("refusing PULL for {:?}: {}", name, e);
            write_text(writer, MsgType::Response, NOT_FOUND_MARKER).await?;
            return Ok(SendOutcome::NotFound);
        }
    };

    let mut file = match open_regular(&path).await {
        Ok(f) => f,
        Err(e) => {
            debug!("PULL {}: {}", name, e);
            write_text(writer, MsgType::Response, NOT_FOUND_MARKER).await?;
            return Ok(SendOutcome::NotFound);
        }
    };

    let mut buf = vec![0u8; chunk_size];
    let mut bytes = 0u64;
    let mut chunks = 0u64;
    loop {
        let n = match read_full(&mut file, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                // Close the stream so the receiver keeps the prefix it has
                write_empty(writer, MsgType::Done).await?;
                return Err(SyncError::Io(e));
            }
        };
        if n == 0 {
            break;
        }
        write_message(writer, MsgType::FileData, &buf[..n]).await?;
        bytes += n as u64;
        chunks += 1;
        if n < chunk_size {
            break;
        }
    }
    write_empty(writer, MsgType::Done).await?;
    Ok(SendOutcome::Sent { bytes, chunks })
}

async fn open_regular(path: &Path) -> std::io::Result<File> {
    let file = File::open(path).await?;
    let md = file.metadata().await?;
    if !md.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "not a regular file",
        ));
    }
    Ok(file)
}

/// Receive one PULL reply into `dest`. The file is created (or truncated)
/// only once data or DONE arrives, never for a RESPONSE.
///
/// If `dest` cannot be written the remaining chunks are still read so the
/// connection stays usable; the error is returned after the file ends.
/// Bytes written before a failure are left in place.
pub async fn receive_file<R>(reader: &mut R, dest: &Path, opts: &ReceiveOptions) -> Result<ReceiveOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_message(reader, opts.max_payload).await?;
    match first.kind() {
        Some(MsgType::Response) => {
            let text = decode_text(&first.payload)?;
            let trimmed = text.trim_end();
            if trimmed == NOT_FOUND_MARKER {
                return Ok(ReceiveOutcome::NotFound);
            }
            return Ok(ReceiveOutcome::Rejected(trimmed.to_string()));
        }
        Some(MsgType::FileData) | Some(MsgType::Done) => {}
        _ => {
            return Err(SyncError::Protocol(format!(
                "unexpected {} in reply to PULL",
                first.describe()
            )))
        }
    }

    let mut local_err: Option<std::io::Error> = None;
    let mut file = match File::create(dest).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("cannot create {}: {}", dest.display(), e);
            local_err = Some(e);
            None
        }
    };

    let mut bytes = 0u64;
    let mut frame: Frame = first;
    let end: Result<EndSignal> = loop {
        match frame.kind() {
            Some(MsgType::Done) => break Ok(EndSignal::Done),
            Some(MsgType::FileData) => {
                let n = frame.payload.len();
                let written = match file.as_mut() {
                    Some(f) => Some(f.write_all(&frame.payload).await),
                    None => None,
                };
                match written {
                    Some(Ok(())) => bytes += n as u64,
                    Some(Err(e)) => {
                        warn!("write to {} failed: {}", dest.display(), e);
                        local_err = Some(e);
                        file = None;
                    }
                    None => {}
                }
                if n < opts.chunk_size {
                    break Ok(EndSignal::ShortChunk);
                }
            }
            _ => {
                break Err(SyncError::Protocol(format!(
                    "unexpected {} during file transfer",
                    frame.describe()
                )))
            }
        }
        frame = match read_message(reader, opts.max_payload).await {
            Ok(f) => f,
            Err(e) => break Err(e),
        };
    };

    // Whatever ended the loop, the received prefix reaches the disk
    if let Some(mut f) = file {
        if let Err(e) = f.flush().await {
            local_err.get_or_insert(e);
        }
    }
    let mut end = end?;

    if end == EndSignal::ShortChunk && consume_trailing_done(reader, opts).await? {
        end = EndSignal::ShortChunkThenDone;
    }

    match local_err {
        Some(e) => Err(SyncError::Io(e)),
        None => Ok(ReceiveOutcome::Received { bytes, end }),
    }
}

/// A sender may follow its short chunk with DONE. Peek (cancel-safe) for up
/// to the grace period and swallow it; `true` when it was consumed. A DONE
/// arriving later is left for the caller to discard before its next reply.
///
/// Nothing but DONE may follow a short chunk. More FILE_DATA means the peers
/// disagree on the chunk size and the file just received is truncated.
async fn consume_trailing_done<R>(reader: &mut R, opts: &ReceiveOptions) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let pending = match timeout(opts.grace, reader.fill_buf()).await {
        Ok(Ok(buf)) => !buf.is_empty(),
        Ok(Err(e)) => return Err(SyncError::Connection(e)),
        Err(_) => false,
    };
    if !pending {
        return Ok(false);
    }
    let frame = read_message(reader, opts.max_payload).await?;
    if frame.is(MsgType::FileData) {
        return Err(SyncError::Protocol(format!(
            "{} after a short chunk; is the sender's chunk size smaller than {}?",
            frame.describe(),
            opts.chunk_size
        )));
    }
    if !frame.is(MsgType::Done) {
        return Err(SyncError::Protocol(format!(
            "unexpected {} after a short chunk",
            frame.describe()
        )));
    }
    Ok(true)
}
