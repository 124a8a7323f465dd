//! Entrypoint for the ingestion server

use std::sync::Arc;

use statingest_clap_blocks::{
    ingest::IngestConfig, logging::LoggingConfig, socket_addr::SocketAddr,
};
use statingest_server::{ServerBuilder, serve};
use statingest_write::{Ingester, backend::MemBackend};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The default bind address for the HTTP API.
pub(crate) const DEFAULT_HTTP_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Invalid ingest config: {0}")]
    Ingest(#[from] statingest_write::Error),

    #[error("Failed to bind address {addr}: {source}")]
    BindAddress {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Cannot listen for shutdown signals: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Server error: {0}")]
    Server(#[from] statingest_server::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// ingestion engine options
    #[clap(flatten)]
    pub(crate) ingest_config: IngestConfig,

    /// The address on which the HTTP API listens.
    #[clap(
        long = "http-bind",
        env = "STATINGEST_HTTP_BIND_ADDR",
        default_value = DEFAULT_HTTP_BIND_ADDR,
        action
    )]
    pub(crate) http_bind_address: SocketAddr,

    /// Maximum size of HTTP requests, after decompression.
    #[clap(
        long = "max-http-request-size",
        env = "STATINGEST_MAX_HTTP_REQUEST_SIZE",
        default_value = "10485760", // 10 MiB
        action
    )]
    pub(crate) max_http_request_size: usize,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let engine_config = config.ingest_config.engine_config();
    info!(
        resolutions = ?engine_config.resolutions,
        lock_shards = engine_config.lock_shards.get(),
        deadline = ?engine_config.deadline,
        "starting statingest"
    );

    let backend = Arc::new(MemBackend::new());
    let ingester = Arc::new(Ingester::new(backend, engine_config)?);

    let listener = TcpListener::bind(*config.http_bind_address)
        .await
        .map_err(|source| Error::BindAddress {
            addr: config.http_bind_address,
            source,
        })?;

    let server = ServerBuilder::new()
        .max_request_size(config.max_http_request_size)
        .ingester(ingester)
        .tcp_listener(listener)
        .build();

    // Construct a token to trigger clean shutdown
    let shutdown = CancellationToken::new();
    let signals = {
        let shutdown = shutdown.clone();
        let signals = Signals::register().map_err(Error::Signal)?;
        tokio::spawn(async move {
            signals.wait().await;
            shutdown.cancel();
        })
    };

    serve(server, shutdown).await?;
    signals.abort();

    Ok(())
}

/// The signals that stop the server.
#[cfg(unix)]
#[derive(Debug)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn wait(mut self) {
        tokio::select! {
            _ = self.term.recv() => info!("Received SIGTERM"),
            _ = self.int.recv() => info!("Received SIGINT"),
        }
    }
}

#[cfg(windows)]
#[derive(Debug, Clone, Copy)]
struct Signals;

#[cfg(windows)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn wait(self) {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT");
    }
}
