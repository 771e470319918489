//! End-to-end tests over real sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::control::PlayerControl;
use super::listener::{Connection, MediaServer, WorkItem};
use super::pool::WorkerPool;
use super::registry::TokenRegistry;
use super::router::RequestRouter;
use super::streamer::RangeFileStreamer;
use super::MediaService;
use crate::config::{CipherKind, ServerConfig};
use crate::crypto::chunked;
use crate::crypto::ctr_stream::CounterStream;
use crate::crypto::kdf::derive_key;
use crate::mime::ExtensionTable;

const ITERATIONS: u32 = 10;

struct Response {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

fn test_config(cipher: CipherKind) -> ServerConfig {
    ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        max_workers: 4,
        cipher,
        kdf_iterations: ITERATIONS,
        ..ServerConfig::default()
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

/// Split `http://host:port/rest` into (`host:port`, `/rest`).
fn split_url(url: &str) -> (String, String) {
    let rest = url.strip_prefix("http://").unwrap();
    let (authority, path) = rest.split_once('/').unwrap();
    (authority.to_string(), format!("/{}", path))
}

fn send(authority: &str, raw_request: &str) -> Response {
    let mut stream = TcpStream::connect(authority).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(raw_request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let pos = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = String::from_utf8(raw[..pos].to_vec()).unwrap();
    let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
    Response {
        status,
        head,
        body: raw[pos + 4..].to_vec(),
    }
}

fn get(url: &str, extra_headers: &str) -> Response {
    let (authority, path) = split_url(url);
    send(
        &authority,
        &format!("GET {} HTTP/1.1\r\nHost: {}\r\n{}\r\n", path, authority, extra_headers),
    )
}

fn write_ctr(path: &Path, plaintext: &[u8], password: &str) {
    let key = derive_key(password, ITERATIONS).unwrap();
    let mut stream = CounterStream::with_key(std::fs::File::create(path).unwrap(), &key);
    stream.write_all(plaintext).unwrap();
}

#[test]
fn test_full_body_and_range_over_ctr() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movie.emp4");
    let plaintext = sample(1000);
    write_ctr(&path, &plaintext, "secret");

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let url = service.open(&path).unwrap();
    let keyed = format!("{};k=secret", url);

    let full = get(&keyed, "");
    assert_eq!(full.status, 200);
    assert_eq!(full.header("content-length").as_deref(), Some("1000"));
    assert_eq!(full.header("accept-ranges").as_deref(), Some("bytes"));
    assert_eq!(full.header("content-type").as_deref(), Some("video/mpeg"));
    assert_eq!(full.header("connection").as_deref(), Some("close"));
    assert_eq!(
        full.header("last-modified").as_deref(),
        Some("Thu, 01 Jan 1970 00:00:00 GMT")
    );
    assert!(full.header("date").is_some());
    assert_eq!(full.body, plaintext);

    let partial = get(&keyed, "Range: bytes=100-199\r\n");
    assert_eq!(partial.status, 206);
    assert_eq!(
        partial.header("content-range").as_deref(),
        Some("bytes 100-199/1000")
    );
    assert_eq!(partial.header("content-length").as_deref(), Some("100"));
    assert_eq!(partial.body, &plaintext[100..200]);

    service.shutdown();
}

#[test]
fn test_plain_file_and_error_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let media = dir.path().join("clip.mp4");
    let notes = dir.path().join("notes.txt");
    std::fs::write(&media, sample(500)).unwrap();
    std::fs::write(&notes, b"not media").unwrap();

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let url = service.open(&media).unwrap();
    let notes_url = service.open(&notes).unwrap();
    let (authority, _) = split_url(&url);

    assert_eq!(get(&url, "Range: bytes=oops\r\n").status, 400);
    assert_eq!(get(&url, "Range: bytes=0-1,5-9\r\n").status, 400);
    assert_eq!(get(&url, "Range: bytes=500-\r\n").status, 400);
    assert_eq!(get(&format!("http://{}/v=ffffffff", authority), "").status, 404);
    assert_eq!(get(&format!("http://{}/nothing", authority), "").status, 404);
    assert_eq!(get(&notes_url, "").status, 404);

    let suffix = get(&url, "Range: bytes=-50\r\n");
    assert_eq!(suffix.status, 206);
    assert_eq!(suffix.body, &sample(500)[450..]);

    service.shutdown();
}

#[test]
fn test_head_request_has_no_body() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    std::fs::write(&path, sample(321)).unwrap();

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let url = service.open(&path).unwrap();
    let (authority, target) = split_url(&url);

    let response = send(
        &authority,
        &format!("HEAD {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, authority),
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-length").as_deref(), Some("321"));
    assert!(response.body.is_empty());

    service.shutdown();
}

#[test]
fn test_chunked_cipher_serving() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.mkv");
    let path = dir.path().join("movie.emkv");
    let plaintext = sample(5000);
    std::fs::write(&source, &plaintext).unwrap();
    let key = derive_key("chunky", ITERATIONS).unwrap();
    chunked::encrypt_file(&source, &path, &key, 1024, |_| {}).unwrap();

    let service = MediaService::new(test_config(CipherKind::Chunked)).unwrap();
    let url = format!("{};k=chunky", service.open(&path).unwrap());

    let full = get(&url, "");
    assert_eq!(full.status, 200);
    assert_eq!(full.body, plaintext);

    let partial = get(&url, "Range: bytes=1000-3071\r\n");
    assert_eq!(partial.status, 206);
    assert_eq!(
        partial.header("content-range").as_deref(),
        Some("bytes 1000-3071/5000")
    );
    assert_eq!(partial.body, &plaintext[1000..3072]);

    service.shutdown();
}

#[test]
fn test_token_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.mp4");
    let b = dir.path().join("b.mp4");
    std::fs::write(&a, sample(10)).unwrap();
    std::fs::write(&b, sample(20)).unwrap();

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let url_a = service.open(&a).unwrap();
    assert_eq!(service.open(&a).unwrap(), url_a);
    let url_b = service.open(&b).unwrap();
    assert_ne!(url_a, url_b);
    assert_eq!(service.active_servers(), 1);

    assert!(service.close(&a));
    assert!(!service.close(&a));
    assert_eq!(get(&url_a, "").status, 404);
    assert_eq!(get(&url_b, "").status, 200);

    assert!(service.close(&b));
    assert_eq!(service.active_servers(), 0);

    service.shutdown();
}

#[test]
fn test_reopen_after_last_close_restarts_server() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.mp4");
    std::fs::write(&path, sample(64)).unwrap();

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    service.open(&path).unwrap();
    service.close(&path);
    assert_eq!(service.active_servers(), 0);

    let url = service.open(&path).unwrap();
    assert_eq!(service.active_servers(), 1);
    assert_eq!(get(&url, "").body, sample(64));

    service.shutdown();
}

#[derive(Default)]
struct CountingPlayer {
    toggles: AtomicUsize,
}

impl PlayerControl for CountingPlayer {
    fn play_pause(&self) {
        self.toggles.fetch_add(1, Ordering::SeqCst);
    }
    fn seek(&self, _position: Duration) {}
    fn set_position_fraction(&self, _fraction: f64) {}
}

#[test]
fn test_control_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.mp4");
    std::fs::write(&path, sample(8)).unwrap();

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let player = Arc::new(CountingPlayer::default());
    service.attach_player(player.clone());
    let (authority, _) = split_url(&service.open(&path).unwrap());

    let page = get(&format!("http://{}/Control", authority), "");
    assert_eq!(page.status, 200);
    assert!(String::from_utf8_lossy(&page.body).contains("/control/playpause"));

    let toggled = send(
        &authority,
        &format!(
            "POST /control/playpause HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\n\r\n",
            authority
        ),
    );
    assert_eq!(toggled.status, 200);
    assert!(toggled.body.is_empty());
    assert_eq!(player.toggles.load(Ordering::SeqCst), 1);

    assert_eq!(get(&format!("http://{}/control/playpause", authority), "").status, 404);
    assert_eq!(player.toggles.load(Ordering::SeqCst), 1);

    service.shutdown();
}

#[test]
fn test_item_for_stopped_server_is_dropped() {
    let pool = WorkerPool::new(1, |_: WorkItem| {});
    let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
    server.listen().unwrap();

    let player = Arc::new(CountingPlayer::default());
    let router = RequestRouter::new(
        Arc::new(TokenRegistry::new()),
        Arc::new(ExtensionTable::default()),
        RangeFileStreamer::new(CipherKind::Ctr, ITERATIONS, "default"),
    );
    router.attach_player(player.clone());

    // a connection accepted before the stop, still waiting in the queue
    let side = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut client = TcpStream::connect(side.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    client
        .write_all(b"POST /control/playpause HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let (stream, peer) = side.accept().unwrap();
    let item = WorkItem {
        server: Arc::clone(&server),
        connection: Connection {
            stream,
            peer: Some(peer),
        },
    };

    server.stop();
    router.handle_connection(item);

    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert!(received.is_empty());
    assert_eq!(player.toggles.load(Ordering::SeqCst), 0);
    pool.shutdown();
}

#[test]
fn test_concurrent_range_requests() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movie.emp4");
    let plaintext = Arc::new(sample(64 * 1024));
    write_ctr(&path, &plaintext, "pw");

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let url = Arc::new(format!("{};k=pw", service.open(&path).unwrap()));

    let clients: Vec<_> = (0..16u64)
        .map(|i| {
            let url = Arc::clone(&url);
            let plaintext = Arc::clone(&plaintext);
            std::thread::spawn(move || {
                let start = i * 3001;
                let end = start + 999;
                let response = get(&url, &format!("Range: bytes={}-{}\r\n", start, end));
                assert_eq!(response.status, 206);
                assert_eq!(response.body, &plaintext[start as usize..=end as usize]);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    assert!(service.pool().completed() >= 16);

    service.shutdown();
}

#[test]
fn test_shutdown_is_idempotent_and_final() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.mp4");
    std::fs::write(&path, sample(8)).unwrap();

    let service = MediaService::new(test_config(CipherKind::Ctr)).unwrap();
    let url = service.open(&path).unwrap();
    let (authority, _) = split_url(&url);
    service.shutdown();
    service.shutdown();

    assert_eq!(service.active_servers(), 0);
    assert!(service.open(dir.path().join("b.mp4")).is_err());

    // listener is closed once the accept thread has been woken
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(&authority).is_ok() {
        assert!(std::time::Instant::now() < deadline, "listener still open");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_invalid_config_rejected() {
    let config = ServerConfig {
        max_workers: 0,
        ..ServerConfig::default()
    };
    assert!(MediaService::new(config).is_err());
}
