use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dirsync::config::SyncConfig;
use dirsync::fingerprint::{fingerprint_bytes, Fingerprint, FingerprintProvider};
use dirsync::frame::{read_message, write_empty, write_message, write_text};
use dirsync::net_async::client::Client;
use dirsync::net_async::server::{serve_listener, ServerContext};
use dirsync::protocol::{MsgType, NOT_FOUND_MARKER};
use dirsync::protocol_core::{build_frame_header, decode_text};
use dirsync::transfer::{EndSignal, ReceiveOutcome};
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

fn write_file(root: &Path, name: &str, data: &[u8]) {
    std::fs::write(root.join(name), data).unwrap();
}

async fn start_server(root: &Path, config: SyncConfig) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let ctx = ServerContext::new(root, config);
    let handle = tokio::spawn(async move {
        let _ = serve_listener(listener, ctx).await;
    });
    (addr, handle)
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diff_reports_only_new_content() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    write_file(server_dir.path(), "a.txt", b"x");
    write_file(server_dir.path(), "b.txt", b"y");
    write_file(client_dir.path(), "a.txt", b"x");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap();

    client.diff().await.unwrap();
    assert_eq!(client.missing().iter().collect::<Vec<_>>(), vec!["b.txt"]);

    client.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_client_pulls_everything() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    write_file(server_dir.path(), "a.txt", b"x");
    write_file(server_dir.path(), "b.txt", b"y");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap();

    assert_eq!(client.list().await.unwrap(), vec!["a.txt", "b.txt"]);

    client.diff().await.unwrap();
    let cached: Vec<String> = client.missing().iter().map(str::to_string).collect();
    assert_eq!(sorted(cached), vec!["a.txt", "b.txt"]);

    let report = client.pull().await.unwrap();
    assert_eq!(report.fetched.len(), 2);
    assert!(report.failed.is_empty());
    assert!(client.missing().is_empty());
    assert_eq!(std::fs::read(client_dir.path().join("a.txt")).unwrap(), b"x");
    assert_eq!(std::fs::read(client_dir.path().join("b.txt")).unwrap(), b"y");

    // Nothing left to report once the contents match
    client.diff().await.unwrap();
    assert!(client.missing().is_empty());

    client.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_of_absent_file_creates_nothing() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap();

    let outcome = client.pull_file("missing.txt").await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::NotFound);
    assert!(!client_dir.path().join("missing.txt").exists());

    // Session still usable afterwards
    assert!(client.list().await.unwrap().is_empty());
    client.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_cache_keeps_first_names() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    write_file(server_dir.path(), "one.txt", b"1");
    write_file(server_dir.path(), "two.txt", b"2");
    write_file(server_dir.path(), "three.txt", b"3");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let config = SyncConfig {
        cache_capacity: 2,
        ..SyncConfig::default()
    };
    let mut client = Client::connect(&addr, client_dir.path(), config).await.unwrap();

    let report = client.diff().await.unwrap();
    assert_eq!(client.missing().len(), 2);
    assert_eq!(report.dropped.len(), 1);
    assert!(report.capacity_exceeded());

    let pulled = client.pull().await.unwrap();
    assert_eq!(pulled.fetched.len(), 2);

    // A second round picks up what did not fit
    client.diff().await.unwrap();
    assert_eq!(client.missing().len(), 1);

    client.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_chunk_without_done_ends_file() {
    let client_dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Peer that never sends DONE after a file
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = read_message(&mut stream, 1024).await.unwrap();
        assert!(req.is(MsgType::Pull));
        assert_eq!(decode_text(&req.payload).unwrap(), "ten.bin");
        for chunk in [&b"0123"[..], &b"4567"[..], &b"89"[..]] {
            write_message(&mut stream, MsgType::FileData, chunk).await.unwrap();
        }
        let next = read_message(&mut stream, 1024).await.unwrap();
        assert!(next.is(MsgType::List));
        write_text(&mut stream, MsgType::Response, "ten.bin\n").await.unwrap();
        let bye = read_message(&mut stream, 1024).await.unwrap();
        assert!(bye.is(MsgType::Leave));
    });

    let config = SyncConfig {
        chunk_size: 4,
        done_grace_ms: 50,
        ..SyncConfig::default()
    };
    let mut client = Client::connect(&addr, client_dir.path(), config).await.unwrap();
    let outcome = client.pull_file("ten.bin").await.unwrap();
    assert_eq!(
        outcome,
        ReceiveOutcome::Received {
            bytes: 10,
            end: EndSignal::ShortChunk
        }
    );
    assert_eq!(std::fs::read(client_dir.path().join("ten.bin")).unwrap(), b"0123456789");

    assert_eq!(client.list().await.unwrap(), vec!["ten.bin"]);
    client.leave().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_preserves_bytes_across_chunks() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    let odd: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let exact: Vec<u8> = (0..8192u32).map(|i| (i % 7) as u8).collect();
    write_file(server_dir.path(), "odd.bin", &odd);
    write_file(server_dir.path(), "exact.bin", &exact);
    write_file(server_dir.path(), "empty.bin", b"");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap();
    client.diff().await.unwrap();
    let report = client.pull().await.unwrap();
    assert_eq!(report.fetched.len(), 3);

    assert_eq!(std::fs::read(client_dir.path().join("odd.bin")).unwrap(), odd);
    assert_eq!(std::fs::read(client_dir.path().join("exact.bin")).unwrap(), exact);
    assert!(std::fs::read(client_dir.path().join("empty.bin")).unwrap().is_empty());

    client.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renamed_copy_is_not_reported() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    write_file(server_dir.path(), "report.pdf", b"%PDF-1.7 quarterly");
    write_file(client_dir.path(), "renamed.pdf", b"%PDF-1.7 quarterly");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap();
    client.diff().await.unwrap();
    assert!(client.missing().is_empty());

    client.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_message_type_is_ignored() {
    let server_dir = tempdir().unwrap();
    write_file(server_dir.path(), "a.txt", b"x");
    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(&build_frame_header(99, 3)).await.unwrap();
    stream.write_all(b"???").await.unwrap();
    write_empty(&mut stream, MsgType::List).await.unwrap();

    let reply = read_message(&mut stream, 1024).await.unwrap();
    assert!(reply.is(MsgType::Response));
    assert_eq!(decode_text(&reply.payload).unwrap(), "a.txt\n");

    write_empty(&mut stream, MsgType::Leave).await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_are_independent() {
    let server_dir = tempdir().unwrap();
    let first_dir = tempdir().unwrap();
    let second_dir = tempdir().unwrap();
    write_file(server_dir.path(), "a.txt", b"x");
    write_file(server_dir.path(), "b.txt", b"y");
    write_file(first_dir.path(), "a.txt", b"x");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut first = Client::connect(&addr, first_dir.path(), SyncConfig::default())
        .await
        .unwrap();
    let mut second = Client::connect(&addr, second_dir.path(), SyncConfig::default())
        .await
        .unwrap();

    let (r1, r2) = tokio::join!(first.diff(), second.diff());
    r1.unwrap();
    r2.unwrap();
    assert_eq!(first.missing().len(), 1);
    assert_eq!(second.missing().len(), 2);

    // One client leaving does not affect the other
    first.leave().await.unwrap();
    let report = second.pull().await.unwrap();
    assert_eq!(report.fetched.len(), 2);
    second.leave().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_done_does_not_shift_next_reply() {
    let client_dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Sends both end signals, but the DONE only after the client gave up waiting
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = read_message(&mut stream, 1024).await.unwrap();
        assert_eq!(decode_text(&req.payload).unwrap(), "a.txt");
        write_message(&mut stream, MsgType::FileData, b"ab").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        write_empty(&mut stream, MsgType::Done).await.unwrap();

        loop {
            let req = read_message(&mut stream, 1024).await.unwrap();
            match req.kind() {
                Some(MsgType::List) => {
                    write_text(&mut stream, MsgType::Response, "a.txt\n").await.unwrap()
                }
                Some(MsgType::Pull) => {
                    assert_eq!(decode_text(&req.payload).unwrap(), "b.txt");
                    write_text(&mut stream, MsgType::Response, NOT_FOUND_MARKER).await.unwrap();
                }
                Some(MsgType::Leave) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
    });

    let config = SyncConfig {
        chunk_size: 4,
        done_grace_ms: 50,
        ..SyncConfig::default()
    };
    let mut client = Client::connect(&addr, client_dir.path(), config).await.unwrap();
    let first = client.pull_file("a.txt").await.unwrap();
    assert_eq!(
        first,
        ReceiveOutcome::Received {
            bytes: 2,
            end: EndSignal::ShortChunk
        }
    );

    let second = client.pull_file("b.txt").await.unwrap();
    assert_eq!(second, ReceiveOutcome::NotFound);
    assert!(!client_dir.path().join("b.txt").exists());

    assert_eq!(client.list().await.unwrap(), vec!["a.txt"]);
    client.leave().await.unwrap();
    peer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_diff_replaces_cached_names() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    write_file(server_dir.path(), "old.txt", b"old");

    let (addr, server) = start_server(server_dir.path(), SyncConfig::default()).await;
    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap();

    client.diff().await.unwrap();
    assert_eq!(client.missing().iter().collect::<Vec<_>>(), vec!["old.txt"]);

    std::fs::remove_file(server_dir.path().join("old.txt")).unwrap();
    write_file(server_dir.path(), "new.txt", b"new");

    // No PULL in between: the stale name must not survive
    client.diff().await.unwrap();
    assert_eq!(client.missing().iter().collect::<Vec<_>>(), vec!["new.txt"]);

    client.leave().await.unwrap();
    server.abort();
}

/// Fingerprints nothing but the first byte of a file
struct FirstByte;

impl FingerprintProvider for FirstByte {
    fn fingerprint_reader(&self, reader: &mut dyn Read) -> io::Result<Fingerprint> {
        let mut first = [0u8; 1];
        let n = reader.read(&mut first)?;
        Ok(fingerprint_bytes(&first[..n]))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diff_follows_injected_provider() {
    let server_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    write_file(server_dir.path(), "same_start.txt", b"xyz");
    write_file(server_dir.path(), "other.txt", b"q");
    write_file(client_dir.path(), "local.txt", b"x-different-tail");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let ctx = ServerContext::new(server_dir.path(), SyncConfig::default()).with_provider(Arc::new(FirstByte));
    let server = tokio::spawn(async move {
        let _ = serve_listener(listener, ctx).await;
    });

    let mut client = Client::connect(&addr, client_dir.path(), SyncConfig::default())
        .await
        .unwrap()
        .with_provider(Arc::new(FirstByte));
    client.diff().await.unwrap();
    // With MD5 both files would be missing
    assert_eq!(client.missing().iter().collect::<Vec<_>>(), vec!["other.txt"]);

    client.leave().await.unwrap();
    server.abort();
}
