//! Echo endpoint: accepts upgrades on one path and sends every complete
//! data message straight back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::codec::read_head;
use crate::config::Config;
use crate::connection::{Connection, Role};
use crate::error::{Error, Result};
use crate::extensions;
use crate::message::{CloseCode, Message};
use crate::protocol::{HandshakeRequest, HandshakeResponse, write_rejection};

/// Upgrade path served by default.
pub const DEFAULT_PATH: &str = "/ws";

/// A running echo server on its own task.
///
/// Each accepted connection gets a task of its own. Dropping the server
/// signals shutdown; [`EchoServer::shutdown`] also waits for the tasks.
#[derive(Debug)]
pub struct EchoServer {
    local_addr: SocketAddr,
    path: Arc<str>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl EchoServer {
    /// Bind and start serving [`DEFAULT_PATH`].
    ///
    /// Bind to `127.0.0.1:0` for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the listener cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        Self::bind_path(addr, DEFAULT_PATH, config).await
    }

    /// Bind and start serving upgrades on `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the listener cannot be bound.
    pub async fn bind_path(addr: impl ToSocketAddrs, path: &str, config: Config) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let path: Arc<str> = Arc::from(path);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(addr = %local_addr, path = %path, "echo server listening");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(config),
            Arc::clone(&path),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            path,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Served upgrade path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `ws://` URL of the endpoint.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.path)
    }

    /// Stop accepting, close open connections with 1001 and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        tracing::info!(addr = %self.local_addr, "echo server stopped");
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    path: Arc<str>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve(
                        stream,
                        peer,
                        Arc::clone(&config),
                        Arc::clone(&path),
                        shutdown.clone(),
                    ));
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            },
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    path: Arc<str>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %err, "set_nodelay failed");
    }
    let upgraded = tokio::time::timeout(config.timeouts.handshake, accept(stream, &config, &path));
    let conn = match upgraded.await {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            tracing::warn!(%peer, error = %err, "upgrade rejected");
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "upgrade timed out");
            return;
        }
    };
    tracing::info!(%peer, compression = conn.negotiated().is_some(), "connection opened");
    echo(conn, peer, config.timeouts.idle, shutdown).await;
}

/// Perform the server side of the upgrade on `stream`.
///
/// Malformed requests are answered with HTTP 400 and requests for another
/// path with 404; both return the error that caused the rejection. An
/// unparseable `Sec-WebSocket-Extensions` header only disables compression.
///
/// # Errors
///
/// Handshake errors, `Error::HandshakeTooLarge`, or transport errors.
pub async fn accept<S>(mut stream: S, config: &Config, path: &str) -> Result<Connection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let request = match read_head(&mut stream, &mut buf, config.limits.max_handshake_size).await {
        Ok(head) => HandshakeRequest::parse(&head).and_then(|req| req.validate().map(|()| req)),
        Err(err @ Error::HandshakeTooLarge { .. }) => Err(err),
        Err(err) => return Err(err),
    };
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            reject(&mut stream, 400, "Bad Request", &err.to_string()).await;
            return Err(err);
        }
    };

    let target = request.path.split('?').next().unwrap_or_default();
    if target != path {
        reject(&mut stream, 404, "Not Found", "no WebSocket endpoint here").await;
        return Err(Error::InvalidHandshake(format!(
            "no endpoint at {}",
            request.path
        )));
    }

    let negotiated = extensions::negotiate(request.extensions.as_deref(), &config.deflate);
    let response = HandshakeResponse::from_request(&request, negotiated.response);
    let mut out = Vec::with_capacity(256);
    response.write(&mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;

    tracing::debug!(
        path = %request.path,
        offered = ?request.extensions,
        accepted = ?response.extensions,
        "upgrade accepted"
    );
    Ok(Connection::with_leftover(
        stream,
        Role::Server,
        config,
        negotiated.params,
        buf,
    ))
}

async fn reject<S: AsyncWrite + Unpin>(stream: &mut S, status: u16, reason: &str, detail: &str) {
    let mut out = Vec::with_capacity(128 + detail.len());
    write_rejection(status, reason, detail, &mut out);
    if stream.write_all(&out).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

/// Echo data messages until the peer closes, an error ends the
/// connection, the idle timeout fires, or the server shuts down.
async fn echo<S>(
    mut conn: Connection<S>,
    peer: SocketAddr,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle, conn.recv()) => next,
            _ = shutdown.changed() => {
                tracing::debug!(%peer, "closing for shutdown");
                let _ = conn.close(CloseCode::GoingAway, "server shutting down").await;
                return;
            }
        };

        match next {
            Err(_) => {
                tracing::info!(%peer, idle_ms = idle.as_millis() as u64, "idle timeout");
                let _ = conn.close(CloseCode::Normal, "idle timeout").await;
                return;
            }
            Ok(Ok(Some(message))) if message.is_data() => {
                let (kind, len) = (message.kind(), message.len());
                if let Err(err) = conn.send(message).await {
                    tracing::warn!(%peer, error = %err, "echo failed");
                    return;
                }
                tracing::debug!(%peer, kind, len, "echoed");
            }
            Ok(Ok(Some(Message::Close(frame)))) => {
                tracing::info!(
                    %peer,
                    code = frame.as_ref().map(|f| f.code.as_u16()),
                    "connection closed by peer"
                );
                return;
            }
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => {
                tracing::info!(%peer, "connection closed");
                return;
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    %peer,
                    code = err.close_code().map(|c| c.as_u16()),
                    error = %err,
                    "connection failed"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compute_accept_key;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(path: &str, extensions: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();
        HandshakeRequest::new("localhost", path, KEY, extensions.map(str::to_string))
            .write(&mut buf)
            .unwrap();
        buf
    }

    async fn exchange(input: Vec<u8>) -> (Result<Connection<DuplexStream>>, String) {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&input).await.unwrap();
        let config = Config::server();
        let result = accept(server, &config, DEFAULT_PATH).await;
        let mut head = BytesMut::new();
        let response = read_head(&mut client, &mut head, 4096).await.unwrap();
        let text = String::from_utf8(response.to_vec()).unwrap();
        (result, text)
    }

    #[tokio::test]
    async fn test_accept_negotiates_deflate() {
        let (result, response) = exchange(request(
            "/ws",
            Some("permessage-deflate; client_max_window_bits"),
        ))
        .await;
        let conn = result.unwrap();
        assert!(conn.negotiated().is_some());
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains(&compute_accept_key(KEY)));
        assert!(response.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
    }

    #[tokio::test]
    async fn test_malformed_extension_header_disables_compression() {
        let (result, response) = exchange(request("/ws", Some("permessage-deflate; =;;"))).await;
        assert!(result.unwrap().negotiated().is_none());
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(!response.contains("Sec-WebSocket-Extensions"));
    }

    #[tokio::test]
    async fn test_unknown_path_gets_404() {
        let (result, response) = exchange(request("/other", None)).await;
        assert!(matches!(result, Err(Error::InvalidHandshake(_))));
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[tokio::test]
    async fn test_malformed_upgrade_gets_400() {
        let (result, response) =
            exchange(b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n".to_vec()).await;
        assert!(matches!(result, Err(Error::InvalidHandshake(_))));
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_and_shutdown() {
        let server = EchoServer::bind("127.0.0.1:0", Config::server()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.url().ends_with("/ws"));

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(&request("/nope", None)).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404"));

        server.shutdown().await;
    }
}
