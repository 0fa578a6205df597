//! HTTP server - Exposes the gateway over HTTP/1.1.
//!
//! One tokio task accepts connections; each connection gets its own task.
//! A maintenance task sweeps expired entries and prunes rate-limit windows.
//! Both stop when the handle sends the shutdown signal.

pub mod body;
pub mod routes;

use crate::config::Config;
use crate::gateway::{Gateway, GatewaySettings};
use crate::rate_limit::RateLimiter;
use crate::storage::{BlobStore, DiskBlobStore, EntryStore};
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use routes::{handle, AppState, ResponseBody, FILE_NAME_HEADER};

/// Handle to a running server, used to stop it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        tracing::info!("[server] Shutdown signal sent");
    }

    /// Wait for the accept loop to exit.
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("Server task failed")
    }
}

/// Build the gateway described by `config`.
pub fn build_gateway(config: &Config) -> Result<Gateway> {
    let blobs = DiskBlobStore::open(&config.storage.blob_dir)?;
    tracing::info!(
        "[server] Using {} blob storage at {}",
        blobs.name(),
        blobs.root().display()
    );
    let store = Arc::new(EntryStore::with_ttl(config.retention.ttl()));
    let gateway = Gateway::new(store, Arc::new(blobs), GatewaySettings::from(config));

    if config.storage.purge_orphans_on_start {
        gateway
            .purge_orphan_blobs()
            .context("Cannot purge leftover blobs")?;
    }
    Ok(gateway)
}

/// Start the server described by `config`. Returns a handle to stop it.
pub async fn start(config: &Config) -> Result<ServerHandle> {
    let gateway = build_gateway(config)?;
    let limiter = RateLimiter::from_config(&config.rate_limit);
    let state = Arc::new(AppState::new(gateway, limiter));

    serve(config.listen_addr(), state, config.retention.sweep_interval()).await
}

/// Bind `addr` and serve `state` until stopped.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    sweep_interval: Duration,
) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind {}", addr))?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(maintenance(
        Arc::clone(&state),
        sweep_interval,
        shutdown_rx.clone(),
    ));
    let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

    tracing::info!("[server] Listening on http://{}", local_addr);
    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("[server] Accept failed: {}", e);
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let client = peer.ip();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle(&state, client, req).await) }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!("[server] Connection from {} ended: {}", peer, e);
                    }
                });
            }
            _ = shutdown_signal(&mut shutdown_rx) => break,
        }
    }
    tracing::info!("[server] Stopped accepting connections");
}

async fn maintenance(
    state: Arc<AppState>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let gateway = state.gateway.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || gateway.sweep_expired()).await {
                    tracing::error!("[server] Expiry sweep failed: {}", e);
                }
                let pruned = state.limiter.prune();
                if pruned > 0 {
                    tracing::debug!("[server] Pruned {} rate-limit windows", pruned);
                }
            }
            _ = shutdown_signal(&mut shutdown_rx) => break,
        }
    }
}

/// Resolves once shutdown is requested or the handle is gone.
async fn shutdown_signal(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}
