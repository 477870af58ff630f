//! Acceptor thread: owns the listening socket and round-robins new
//! connections out to the worker pool (spec.md §4.2, §6).
//!
//! Kept deliberately dumb — a blocking `std::net::TcpListener::accept`
//! loop, no `mio` of its own — since the only thing it ever does with a
//! socket is hand it straight to a worker's inbox.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::{Poll, Waker};

use crate::server::Server;
use crate::worker::{Dispatch, Worker, WorkerHandle};

const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Spawns one worker thread per `server.config.worker_threads` and binds
/// the listening socket, then blocks the calling thread running the
/// acceptor loop forever (or until the listener errors out).
pub fn run(server: Arc<Server>) -> std::io::Result<()> {
    let n = server.config.worker_threads.max(1);
    let mut handles = Vec::with_capacity(n);
    let mut joins: Vec<JoinHandle<()>> = Vec::with_capacity(n);
    let mut polls = Vec::with_capacity(n);
    let mut rxs = Vec::with_capacity(n);

    for _ in 0..n {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = channel();
        handles.push(WorkerHandle { tx, waker });
        polls.push(poll);
        rxs.push(rx);
    }

    for id in 0..n {
        let poll = polls.remove(0);
        let rx = rxs.remove(0);
        let srv = Arc::clone(&server);
        let peers = handles.clone();
        joins.push(std::thread::Builder::new().name(format!("vire-worker-{id}")).spawn(move || {
            Worker::new(id, srv, poll, rx, peers).run();
        })?);
    }

    let listener = TcpListener::bind((server.config.bind_addr.as_str(), server.config.port))?;
    log::info!("vire listening on {}:{}", server.config.bind_addr, server.config.port);
    accept_loop(&listener, &handles)
}

fn accept_loop(listener: &TcpListener, handles: &[WorkerHandle]) -> std::io::Result<()> {
    let next_id = AtomicU64::new(1);
    let mut rr = 0usize;
    loop {
        let (stream, addr) = listener.accept()?;
        stream.set_nonblocking(true)?;
        let mio_stream = mio::net::TcpStream::from_std(stream);
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let target = rr % handles.len();
        rr = rr.wrapping_add(1);
        let handle = &handles[target];
        if handle.tx.send(Dispatch::NewConn { stream: mio_stream, id, addr }).is_ok() {
            handle.waker.wake();
        }
    }
}
