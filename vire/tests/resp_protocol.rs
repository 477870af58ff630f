//! End-to-end tests driving the RESP wire protocol over a loopback
//! `TcpStream`, covering the worked scenarios from spec.md §8: SET/GET,
//! INCRBY, PX expiry, RPUSH/LRANGE, SADD/SMEMBERS/SISMEMBER, and CLIENT
//! LIST across more than one connection (and, since `worker_threads > 1`
//! here, more than one worker).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vire_core::config::Config;
use vire_core::{master, Server};

static NEXT_PORT: AtomicU16 = AtomicU16::new(17100);

fn start_server() -> u16 {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.port = port;
    config.manage_port = port + 2000;
    config.worker_threads = 2;
    config.internal_shards = 4;
    config.dir = dir.path().to_string_lossy().to_string();
    config.cron_interval_ms = 20;
    let server = Arc::new(Server::new(config));
    std::thread::spawn(move || {
        let _ = master::run(server);
    });
    // Keep the tempdir alive for the lifetime of the server thread by
    // leaking it: the server never removes its own data directory, and the
    // OS reclaims it at process exit.
    std::mem::forget(dir);
    for _ in 0..200 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return port;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server never started listening on port {port}");
}

fn encode(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for a in args {
        out.extend_from_slice(format!("${}\r\n", a.len()).as_bytes());
        out.extend_from_slice(a.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Sends one request and reads back whatever is available after a short
/// settle delay. Good enough for these single-reply-per-request scenarios;
/// none of them pipeline.
fn roundtrip(stream: &mut TcpStream, args: &[&str]) -> String {
    stream.write_all(&encode(args)).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 65536];
    let n = stream.read(&mut buf).expect("read reply");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[test]
fn set_and_get_roundtrip() {
    let port = start_server();
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(roundtrip(&mut conn, &["SET", "greeting", "hello"]), "+OK\r\n");
    assert_eq!(roundtrip(&mut conn, &["GET", "greeting"]), "$5\r\nhello\r\n");
    assert_eq!(roundtrip(&mut conn, &["GET", "missing"]), "$-1\r\n");
}

#[test]
fn incrby_on_a_fresh_key_starts_at_zero() {
    let port = start_server();
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(roundtrip(&mut conn, &["INCRBY", "counter", "5"]), ":5\r\n");
    assert_eq!(roundtrip(&mut conn, &["INCRBY", "counter", "37"]), ":42\r\n");
}

#[test]
fn px_expiry_makes_the_key_disappear() {
    let port = start_server();
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(roundtrip(&mut conn, &["SET", "flash", "gone-soon", "PX", "50"]), "+OK\r\n");
    assert_eq!(roundtrip(&mut conn, &["GET", "flash"]), "$9\r\ngone-soon\r\n");
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(roundtrip(&mut conn, &["GET", "flash"]), "$-1\r\n");
}

#[test]
fn list_push_and_range() {
    let port = start_server();
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(roundtrip(&mut conn, &["RPUSH", "queue", "a", "b", "c"]), ":3\r\n");
    assert_eq!(roundtrip(&mut conn, &["LRANGE", "queue", "0", "-1"]), "*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
}

#[test]
fn set_membership_roundtrip() {
    let port = start_server();
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(roundtrip(&mut conn, &["SADD", "tags", "rust", "kv"]), ":2\r\n");
    assert_eq!(roundtrip(&mut conn, &["SISMEMBER", "tags", "rust"]), ":1\r\n");
    assert_eq!(roundtrip(&mut conn, &["SISMEMBER", "tags", "go"]), ":0\r\n");
    let members = roundtrip(&mut conn, &["SMEMBERS", "tags"]);
    assert!(members.contains("rust") && members.contains("kv"));
}

#[test]
fn client_list_sees_connections_on_other_workers() {
    let port = start_server();
    let mut a = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut b = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut c = TcpStream::connect(("127.0.0.1", port)).unwrap();
    // Give the acceptor's round-robin a moment to hand each connection to
    // a (likely distinct) worker before asking for the roster.
    std::thread::sleep(Duration::from_millis(50));
    let _ = roundtrip(&mut b, &["PING"]);
    let _ = roundtrip(&mut c, &["PING"]);
    let reply = roundtrip(&mut a, &["CLIENT", "LIST"]);
    assert!(reply.starts_with('$'));
    let lines: Vec<&str> = reply.matches("id=").collect();
    assert_eq!(lines.len(), 3, "expected all three connections listed, got: {reply}");
}
