//! HTTP front end of the ingestion engine.
//!
//! Build a [`Server`] with [`ServerBuilder`] and run it with [`serve`] until the shutdown token
//! is cancelled.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{
    Request,
    server::conn::{AddrIncoming, AddrStream},
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http::HttpApi;

pub mod builder;
pub mod http;

pub use builder::ServerBuilder;

#[derive(Debug, Error)]
pub enum Error {
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("cannot use the listening socket: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub struct Server {
    http: Arc<HttpApi>,
    listener: TcpListener,
}

impl Server {
    /// Address the server accepts connections on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn http(&self) -> &Arc<HttpApi> {
        &self.http
    }
}

/// Serve HTTP requests until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(server: Server, shutdown: CancellationToken) -> Result<()> {
    let addr = server.local_addr()?;
    let incoming = AddrIncoming::from_listener(server.listener)?;
    let api = server.http;

    info!(%addr, "HTTP server listening");

    hyper::Server::builder(incoming)
        .serve(hyper::service::make_service_fn(|_conn: &AddrStream| {
            let api = Arc::clone(&api);
            let service = hyper::service::service_fn(move |request: Request<_>| {
                http::route_request(Arc::clone(&api), request)
            });
            std::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.cancelled())
        .await?;

    info!(%addr, "HTTP server stopped");
    Ok(())
}
