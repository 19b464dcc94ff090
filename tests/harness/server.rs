//! Echo server on a random port.

use std::net::SocketAddr;

use pmdecho::{Config, EchoServer};

/// Echo server bound to `127.0.0.1:0`.
pub struct TestServer {
    inner: EchoServer,
}

impl TestServer {
    /// Spawn a server with the default configuration.
    pub async fn spawn() -> (Self, SocketAddr) {
        Self::spawn_with(Config::server()).await
    }

    /// Spawn a server with a custom configuration.
    pub async fn spawn_with(config: Config) -> (Self, SocketAddr) {
        super::init_tracing();
        let inner = EchoServer::bind("127.0.0.1:0", config)
            .await
            .expect("bind echo server");
        let addr = inner.local_addr();
        (Self { inner }, addr)
    }

    pub fn url(&self) -> String {
        self.inner.url()
    }

    /// Close open connections and wait for the server to stop.
    pub async fn shutdown(self) {
        self.inner.shutdown().await;
    }
}
