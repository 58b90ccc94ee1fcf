//! Async framed message I/O
//!
//! Every message is an 8-byte header followed by exactly `length` payload
//! bytes. Reads accumulate until the header and then the payload are complete,
//! so a short `read` from the transport never splits a message.

use crate::error::{Result, SyncError};
use crate::protocol::{MsgType, HEADER_LEN};
use crate::protocol_core::{build_frame_header, encode_text, parse_frame_header, validate_frame_size};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::from_code(self.code)
    }

    pub fn is(&self, t: MsgType) -> bool {
        self.code == t.code()
    }

    pub fn describe(&self) -> String {
        match self.kind() {
            Some(t) => format!("{} ({} bytes)", t, self.payload.len()),
            None => format!("unknown type {} ({} bytes)", self.code, self.payload.len()),
        }
    }
}

/// Fill `buf` until it is full or the reader hits EOF; returns bytes read.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub async fn write_message<W>(writer: &mut W, t: MsgType, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        SyncError::Protocol(format!("payload of {} bytes exceeds u32 length", payload.len()))
    })?;
    let hdr = build_frame_header(t.code(), len);
    writer.write_all(&hdr).await.map_err(SyncError::Connection)?;
    if !payload.is_empty() {
        writer.write_all(payload).await.map_err(SyncError::Connection)?;
    }
    writer.flush().await.map_err(SyncError::Connection)?;
    Ok(())
}

pub async fn write_text<W>(writer: &mut W, t: MsgType, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, t, &encode_text(text)).await
}

pub async fn write_empty<W>(writer: &mut W, t: MsgType) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, t, &[]).await
}

pub async fn read_message<R>(reader: &mut R, max_payload: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut hdr).await.map_err(SyncError::Connection)?;
    if got == 0 {
        return Err(SyncError::ConnectionClosed);
    }
    if got < HEADER_LEN {
        return Err(SyncError::Truncated { expected: HEADER_LEN, received: got });
    }
    let (code, len) = parse_frame_header(&hdr);
    let len = len as usize;

    if let Err(e) = validate_frame_size(len, max_payload) {
        // Discard the oversize body so the next header is read at a boundary
        let drained = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink())
            .await
            .map_err(SyncError::Connection)? as usize;
        if drained < len {
            return Err(SyncError::Truncated { expected: len, received: drained });
        }
        return Err(e);
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        let got = read_full(reader, &mut payload).await.map_err(SyncError::Connection)?;
        if got < len {
            return Err(SyncError::Truncated { expected: len, received: got });
        }
    }
    Ok(Frame { code, payload })
}
