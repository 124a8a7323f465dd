use std::sync::Arc;

use statingest_write::Ingester;
use tokio::net::TcpListener;

use crate::{Server, http::HttpApi};

/// Request size limit used unless [`ServerBuilder::max_request_size`] is called.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub struct ServerBuilder<I, L> {
    max_request_size: usize,
    ingester: I,
    listener: L,
}

impl ServerBuilder<NoIngester, NoListener> {
    pub fn new() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            ingester: NoIngester,
            listener: NoListener,
        }
    }
}

impl Default for ServerBuilder<NoIngester, NoListener> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, L> ServerBuilder<I, L> {
    pub fn max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoIngester;
#[derive(Debug)]
pub struct WithIngester(Arc<Ingester>);
#[derive(Debug, Clone, Copy)]
pub struct NoListener;
#[derive(Debug)]
pub struct WithListener(TcpListener);

impl<L> ServerBuilder<NoIngester, L> {
    pub fn ingester(self, ingester: Arc<Ingester>) -> ServerBuilder<WithIngester, L> {
        ServerBuilder {
            max_request_size: self.max_request_size,
            ingester: WithIngester(ingester),
            listener: self.listener,
        }
    }
}

impl<I> ServerBuilder<I, NoListener> {
    pub fn tcp_listener(self, listener: TcpListener) -> ServerBuilder<I, WithListener> {
        ServerBuilder {
            max_request_size: self.max_request_size,
            ingester: self.ingester,
            listener: WithListener(listener),
        }
    }
}

impl ServerBuilder<WithIngester, WithListener> {
    pub fn build(self) -> Server {
        let http = Arc::new(HttpApi::new(self.ingester.0, self.max_request_size));
        Server {
            http,
            listener: self.listener.0,
        }
    }
}
