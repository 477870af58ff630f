//! The manage/stats endpoint: a tiny `tokio`-driven TCP listener, separate
//! from the RESP worker pool, that answers a connection with one JSON line
//! describing the server's current `Stats` snapshot and then closes.
//!
//! Grounded on `examples/lithair-lithair/lithair-core/src/http/async_server.rs`'s
//! `TcpListener::bind` + per-connection `tokio::task::spawn` shape, trimmed
//! down from a full Hyper HTTP server (this endpoint speaks no HTTP, just
//! one JSON document per connection) since nothing else in this server
//! needs routing, headers, or keep-alive.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::server::Server;

/// Spawns a dedicated OS thread running its own single-threaded `tokio`
/// runtime for the manage endpoint, so the async runtime never competes
/// with the `mio` worker pool's threads for a scheduler.
pub fn spawn(server: Arc<Server>) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new().name("vire-manage".to_string()).spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("manage endpoint: failed to start runtime: {e}");
                return;
            }
        };
        if let Err(e) = rt.block_on(run(server)) {
            log::error!("manage endpoint stopped: {e}");
        }
    })
}

async fn run(server: Arc<Server>) -> std::io::Result<()> {
    let addr = (server.config.manage_addr.as_str(), server.config.manage_port);
    let listener = TcpListener::bind(addr).await?;
    log::info!("manage endpoint listening on {}:{}", server.config.manage_addr, server.config.manage_port);
    loop {
        let (mut stream, _peer) = listener.accept().await?;
        let server = Arc::clone(&server);
        tokio::task::spawn(async move {
            let snapshot = server.stats.snapshot();
            let mut body = match serde_json::to_vec(&snapshot) {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("manage endpoint: failed to encode stats: {e}");
                    return;
                }
            };
            body.push(b'\n');
            if let Err(e) = stream.write_all(&body).await {
                log::debug!("manage endpoint: write failed: {e}");
            }
            let _ = stream.shutdown().await;
        });
    }
}
