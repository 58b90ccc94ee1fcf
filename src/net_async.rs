//! Async (Tokio) transport for the dirsync daemon and client.
//!
//! One task per accepted connection on the server; the client is a single
//! sequential conversation. Both sides speak the framed protocol from
//! [`crate::frame`] and never interleave operations on one connection.

use std::io;

use crate::error::SyncError;

fn join_error(e: tokio::task::JoinError) -> SyncError {
    SyncError::Io(io::Error::other(e))
}

pub mod server {
    use super::*;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use tokio::io::{AsyncRead, AsyncWrite, BufReader};
    use tokio::net::TcpListener;
    use tracing::{debug, error, info, info_span, warn, Instrument};

    use crate::config::SyncConfig;
    use crate::error::Result as SyncResult;
    use crate::fingerprint::{FingerprintProvider, Md5Provider};
    use crate::frame::{read_message, write_empty, write_text};
    use crate::fs_enum::{fingerprint_directory, list_regular_files};
    use crate::protocol::{MsgType, LIST_TRUNCATED_MARKER, LIST_UNAVAILABLE, NOT_FOUND_MARKER};
    use crate::protocol_core::decode_text;
    use crate::reconcile::{collect_fingerprints, missing_names, send_report};
    use crate::transfer::{send_file, SendOutcome};

    /// Everything a session needs; cloned into each connection task
    #[derive(Clone)]
    pub struct ServerContext {
        pub root: PathBuf,
        pub config: SyncConfig,
        pub provider: Arc<dyn FingerprintProvider>,
    }

    impl ServerContext {
        pub fn new(root: impl Into<PathBuf>, config: SyncConfig) -> Self {
            Self {
                root: root.into(),
                config,
                provider: Arc::new(Md5Provider),
            }
        }

        pub fn with_provider(mut self, provider: Arc<dyn FingerprintProvider>) -> Self {
            self.provider = provider;
            self
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SessionState {
        /// Waiting for the next command
        Idle,
        Closed,
    }

    #[derive(Debug)]
    pub enum SessionEnd {
        Leave,
        /// Peer closed the connection between messages
        Disconnected,
        Failed(SyncError),
    }

    pub async fn serve(bind: &str, ctx: ServerContext) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        serve_listener(listener, ctx).await
    }

    /// Accept loop. Every connection gets its own task and runs until LEAVE or
    /// until the connection drops; the number of live sessions is not limited.
    pub async fn serve_listener(listener: TcpListener, ctx: ServerContext) -> Result<()> {
        info!(
            "dirsync daemon listening on {} root={}",
            listener.local_addr()?,
            ctx.root.display()
        );
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let ctx = ctx.clone();
            tokio::spawn(
                async move {
                    info!("connection accepted");
                    let (rd, wr) = stream.into_split();
                    let end = run_session(BufReader::new(rd), wr, &ctx).await;
                    log_end(peer, &end);
                }
                .instrument(info_span!("session", %peer)),
            );
        }
    }

    fn log_end(peer: SocketAddr, end: &SessionEnd) {
        match end {
            SessionEnd::Leave => info!("client {} left", peer),
            SessionEnd::Disconnected => info!("client {} disconnected", peer),
            SessionEnd::Failed(e) => warn!("session with {} failed: {}", peer, e),
        }
    }

    pub async fn run_session<R, W>(reader: R, writer: W, ctx: &ServerContext) -> SessionEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Session::new(reader, writer, ctx).run().await
    }

    /// Server half of one connection
    pub struct Session<'a, R, W> {
        reader: R,
        writer: W,
        ctx: &'a ServerContext,
        state: SessionState,
    }

    impl<'a, R, W> Session<'a, R, W>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        pub fn new(reader: R, writer: W, ctx: &'a ServerContext) -> Self {
            Self {
                reader,
                writer,
                ctx,
                state: SessionState::Idle,
            }
        }

        pub fn state(&self) -> SessionState {
            self.state
        }

        /// Serve commands until the session closes. Reader and writer are
        /// dropped (and the connection released) when this returns.
        pub async fn run(mut self) -> SessionEnd {
            loop {
                if let Some(end) = self.step().await {
                    self.state = SessionState::Closed;
                    return end;
                }
            }
        }

        /// Read and dispatch one message; `Some` when the session is over.
        pub async fn step(&mut self) -> Option<SessionEnd> {
            let max = self.ctx.config.max_payload;
            let frame = match read_message(&mut self.reader, max).await {
                Ok(f) => f,
                Err(e) if e.is_clean_close() => return Some(SessionEnd::Disconnected),
                Err(e) if e.is_fatal() => return Some(SessionEnd::Failed(e)),
                Err(e) => {
                    warn!("{}", e);
                    return None;
                }
            };
            debug!("received {}", frame.describe());

            let result = match frame.kind() {
                Some(MsgType::List) => self.handle_list().await,
                Some(MsgType::Diff) => self.handle_diff().await,
                Some(MsgType::Pull) => self.handle_pull(&frame.payload).await,
                Some(MsgType::Leave) => return Some(SessionEnd::Leave),
                Some(other) => {
                    warn!("ignoring {} outside of an operation", other);
                    Ok(())
                }
                None => {
                    warn!("ignoring unknown message type {}", frame.code);
                    Ok(())
                }
            };

            match result {
                Ok(()) => None,
                Err(e) if e.is_clean_close() => Some(SessionEnd::Disconnected),
                Err(e) if e.is_fatal() => Some(SessionEnd::Failed(e)),
                Err(e) => {
                    error!("operation aborted: {}", e);
                    None
                }
            }
        }

        async fn handle_list(&mut self) -> SyncResult<()> {
            let root = self.ctx.root.clone();
            let listing = tokio::task::spawn_blocking(move || list_regular_files(&root))
                .await
                .map_err(join_error)?;
            let body = match listing {
                Ok(names) => format_listing(&names, self.ctx.config.max_payload),
                Err(e) => {
                    warn!("cannot list {}: {}", self.ctx.root.display(), e);
                    LIST_UNAVAILABLE.to_string()
                }
            };
            write_text(&mut self.writer, MsgType::Response, &body).await
        }

        async fn handle_diff(&mut self) -> SyncResult<()> {
            let max = self.ctx.config.max_payload;
            let client = match collect_fingerprints(&mut self.reader, max).await {
                Ok(set) => set,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // Close the round so the client is not left waiting
                    write_empty(&mut self.writer, MsgType::Done).await?;
                    return Err(e);
                }
            };

            let root = self.ctx.root.clone();
            let provider = self.ctx.provider.clone();
            let scan = tokio::task::spawn_blocking(move || fingerprint_directory(&root, provider.as_ref()))
                .await
                .map_err(join_error)?;
            let server = match scan {
                Ok(entries) => entries,
                Err(e) => {
                    write_empty(&mut self.writer, MsgType::Done).await?;
                    return Err(SyncError::Io(e));
                }
            };

            let names = missing_names(&server, &client);
            info!(
                "DIFF: {} client fingerprints, {} server files, {} missing",
                client.len(),
                server.len(),
                names.len()
            );
            send_report(&mut self.writer, &names).await
        }

        async fn handle_pull(&mut self, payload: &[u8]) -> SyncResult<()> {
            let name = match decode_text(payload) {
                Ok(n) => n,
                Err(e) => {
                    write_text(&mut self.writer, MsgType::Response, NOT_FOUND_MARKER).await?;
                    return Err(e);
                }
            };
            match send_file(&mut self.writer, &self.ctx.root, &name, self.ctx.config.chunk_size).await? {
                SendOutcome::Sent { bytes, chunks } => {
                    info!("sent {} ({} bytes, {} chunks)", name, bytes, chunks)
                }
                SendOutcome::NotFound => info!("file {} not found", name),
            }
            Ok(())
        }
    }

    /// `name\n` per file. A listing that would overflow one payload is cut
    /// short and ends with a marker line, if even the marker fits.
    pub fn format_listing(names: &[String], max_payload: usize) -> String {
        // Terminating NUL
        let limit = max_payload.saturating_sub(1);
        let full: usize = names.iter().map(|n| n.len() + 1).sum();
        let marker = if full > limit && LIST_TRUNCATED_MARKER.len() <= limit {
            LIST_TRUNCATED_MARKER
        } else {
            ""
        };
        let budget = limit - marker.len();

        let mut out = String::new();
        for (i, name) in names.iter().enumerate() {
            if out.len() + name.len() + 1 > budget {
                warn!("listing truncated after {} of {} entries", i, names.len());
                break;
            }
            out.push_str(name);
            out.push('\n');
        }
        out.push_str(marker);
        out
    }

}

pub mod client {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use indicatif::{ProgressBar, ProgressStyle};
    use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tracing::{debug, error, info, warn};

    use crate::config::SyncConfig;
    use crate::error::Result;
    use crate::fingerprint::{FingerprintProvider, Md5Provider};
    use crate::frame::{read_message, write_empty, write_text, Frame};
    use crate::fs_enum::fingerprint_directory;
    use crate::missing_set::MissingSet;
    use crate::protocol::{MsgType, LIST_UNAVAILABLE};
    use crate::protocol_core::{decode_text, validate_flat_name};
    use crate::reconcile::{receive_report, send_fingerprints, DiffReport};
    use crate::transfer::{receive_file, ReceiveOptions, ReceiveOutcome};

    /// Result of draining the missing-file cache
    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub struct PullReport {
        pub fetched: Vec<(String, u64)>,
        pub not_found: Vec<String>,
        pub failed: Vec<(String, String)>,
        /// Never requested because the round was aborted
        pub skipped: Vec<String>,
    }

    /// Client half of one connection. Owns the missing-file cache, so pending
    /// work never outlives or leaks between connections.
    pub struct Client<R, W> {
        reader: BufReader<R>,
        writer: W,
        root: PathBuf,
        config: SyncConfig,
        provider: Arc<dyn FingerprintProvider>,
        missing: MissingSet,
        progress: bool,
        /// The last file ended on a short chunk and its DONE has not been seen
        done_owed: bool,
    }

    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await.map_err(SyncError::Connection)?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    impl Client<OwnedReadHalf, OwnedWriteHalf> {
        pub async fn connect(addr: &str, root: impl Into<PathBuf>, config: SyncConfig) -> Result<Self> {
            let stream = connect(addr).await?;
            info!("connected to {}", addr);
            let (rd, wr) = stream.into_split();
            Ok(Self::new(rd, wr, root, config))
        }
    }

    impl<R, W> Client<R, W>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        pub fn new(reader: R, writer: W, root: impl Into<PathBuf>, config: SyncConfig) -> Self {
            let missing = MissingSet::with_capacity(config.cache_capacity);
            Self {
                reader: BufReader::new(reader),
                writer,
                root: root.into(),
                config,
                provider: Arc::new(Md5Provider),
                missing,
                progress: false,
                done_owed: false,
            }
        }

        pub fn with_provider(mut self, provider: Arc<dyn FingerprintProvider>) -> Self {
            self.provider = provider;
            self
        }

        pub fn with_progress(mut self, progress: bool) -> Self {
            self.progress = progress;
            self
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn missing(&self) -> &MissingSet {
            &self.missing
        }

        /// First frame of a reply that never starts with DONE. A late DONE
        /// from the previous file is dropped on the way.
        async fn read_reply(&mut self) -> Result<Frame> {
            let mut frame = read_message(&mut self.reader, self.config.max_payload).await?;
            if self.done_owed && frame.is(MsgType::Done) {
                debug!("dropping late DONE from the previous file");
                frame = read_message(&mut self.reader, self.config.max_payload).await?;
            }
            self.done_owed = false;
            Ok(frame)
        }

        /// Replies to DIFF and PULL may start with DONE, so an owed DONE
        /// cannot be told apart there. Flush it first with a LIST, whose
        /// reply is always a RESPONSE.
        async fn settle_owed_done(&mut self) -> Result<()> {
            if !self.done_owed {
                return Ok(());
            }
            write_empty(&mut self.writer, MsgType::List).await?;
            let frame = self.read_reply().await?;
            if !frame.is(MsgType::Response) {
                return Err(SyncError::Protocol(format!(
                    "unexpected {} in reply to LIST",
                    frame.describe()
                )));
            }
            Ok(())
        }

        /// Names of the regular files in the server directory
        pub async fn list(&mut self) -> Result<Vec<String>> {
            write_empty(&mut self.writer, MsgType::List).await?;
            let frame = self.read_reply().await?;
            if !frame.is(MsgType::Response) {
                return Err(SyncError::Protocol(format!(
                    "unexpected {} in reply to LIST",
                    frame.describe()
                )));
            }
            let text = decode_text(&frame.payload)?;
            if text == LIST_UNAVAILABLE {
                return Err(SyncError::NotFound("server directory".to_string()));
            }
            Ok(text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
        }

        /// Run one DIFF round. Any names still cached from an earlier round
        /// are discarded first, pulled or not.
        pub async fn diff(&mut self) -> Result<DiffReport> {
            if !self.missing.is_empty() {
                warn!("discarding {} unpulled entries from the previous DIFF", self.missing.len());
            }
            self.missing.clear();

            // Scan before sending anything, so a local failure leaves the
            // connection idle
            let root = self.root.clone();
            let provider = self.provider.clone();
            let entries = tokio::task::spawn_blocking(move || fingerprint_directory(&root, provider.as_ref()))
                .await
                .map_err(join_error)??;
            debug!("sending {} fingerprints", entries.len());

            self.settle_owed_done().await?;
            write_empty(&mut self.writer, MsgType::Diff).await?;
            send_fingerprints(&mut self.writer, &entries).await?;
            let report = receive_report(&mut self.reader, &mut self.missing, self.config.max_payload).await?;
            if report.capacity_exceeded() {
                warn!(
                    "missing-file cache full: kept {}, dropped {}",
                    self.missing.len(),
                    report.dropped.len()
                );
            }
            Ok(report)
        }

        /// Fetch every cached name in order. The cache is empty afterwards,
        /// however the round ends.
        pub async fn pull(&mut self) -> Result<PullReport> {
            let names = self.missing.take();
            let mut report = PullReport::default();
            let bar = if self.progress {
                let pb = ProgressBar::new(names.len() as u64);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{bar:30} {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                pb
            } else {
                ProgressBar::hidden()
            };

            let mut pending = names.into_iter();
            while let Some(name) = pending.next() {
                bar.set_message(name.clone());
                match self.pull_file(&name).await {
                    Ok(ReceiveOutcome::Received { bytes, .. }) => report.fetched.push((name, bytes)),
                    Ok(ReceiveOutcome::NotFound) => report.not_found.push(name),
                    Ok(ReceiveOutcome::Rejected(msg)) => report.failed.push((name, msg)),
                    Err(e) if e.is_fatal() => {
                        bar.abandon();
                        return Err(e);
                    }
                    Err(SyncError::Protocol(msg)) => {
                        error!("PULL round aborted at {}: {}", name, msg);
                        report.failed.push((name, msg));
                        report.skipped.extend(pending);
                        break;
                    }
                    Err(e) => report.failed.push((name, e.to_string())),
                }
                bar.inc(1);
            }
            bar.finish_and_clear();
            Ok(report)
        }

        /// Request a single file by name into the local root.
        pub async fn pull_file(&mut self, name: &str) -> Result<ReceiveOutcome> {
            validate_flat_name(name)?;
            let dest = self.root.join(name);
            self.settle_owed_done().await?;
            write_text(&mut self.writer, MsgType::Pull, name).await?;
            let opts = ReceiveOptions {
                chunk_size: self.config.chunk_size,
                max_payload: self.config.max_payload,
                grace: self.config.done_grace(),
            };
            let result = receive_file(&mut self.reader, &dest, &opts).await;
            self.done_owed = match &result {
                Ok(ReceiveOutcome::Received { end, .. }) => end.done_owed(),
                // The end signal is unknown after a local failure
                Err(SyncError::Io(_)) => true,
                _ => false,
            };
            let outcome = result?;
            match &outcome {
                ReceiveOutcome::Received { bytes, end } => {
                    info!("pulled {} ({} bytes, ended by {:?})", name, bytes, end)
                }
                ReceiveOutcome::NotFound => info!("{} not found on server", name),
                ReceiveOutcome::Rejected(msg) => warn!("server refused {}: {}", name, msg),
            }
            Ok(outcome)
        }

        /// Say goodbye and close the write side.
        pub async fn leave(mut self) -> Result<()> {
            write_empty(&mut self.writer, MsgType::Leave).await?;
            self.writer.shutdown().await.map_err(SyncError::Connection)?;
            Ok(())
        }
    }
}
