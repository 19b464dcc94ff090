//! Client wrapper with typed send/receive helpers.

use std::net::SocketAddr;

use pmdecho::client;
use pmdecho::server::DEFAULT_PATH;
use pmdecho::{CloseCode, Config, Connection, Message, Result};
use tokio::net::TcpStream;

/// Upgraded client connection tagged with an id for diagnostics.
pub struct TestClient {
    pub id: usize,
    pub conn: Connection<TcpStream>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, 0, &Config::client()).await
    }

    pub async fn connect_with_id(addr: SocketAddr, id: usize) -> Result<Self> {
        Self::connect_with(addr, id, &Config::client()).await
    }

    pub async fn connect_with(addr: SocketAddr, id: usize, config: &Config) -> Result<Self> {
        let conn = client::connect(addr, DEFAULT_PATH, config).await?;
        Ok(Self { id, conn })
    }

    pub fn is_compressed(&self) -> bool {
        self.conn.negotiated().is_some()
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.conn.send(Message::text(text)).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.conn.send(Message::binary(data.to_vec())).await
    }

    /// Next text message; pongs and pings are skipped.
    pub async fn recv_text(&mut self) -> Result<Option<String>> {
        Ok(self.recv_data().await?.and_then(Message::into_text))
    }

    /// Next binary message; pongs and pings are skipped.
    pub async fn recv_binary(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.recv_data().await?.and_then(Message::into_binary))
    }

    /// Next data or close message.
    pub async fn recv_data(&mut self) -> Result<Option<Message>> {
        loop {
            match self.conn.recv().await? {
                Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
                other => return Ok(other),
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.conn.close(CloseCode::Normal, "").await
    }
}
