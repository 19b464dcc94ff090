//! Client side of the upgrade, offering permessage-deflate.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::codec::read_head;
use crate::config::Config;
use crate::connection::{Connection, Role};
use crate::error::{Error, Result};
use crate::extensions;
use crate::protocol::{HandshakeRequest, HandshakeResponse, generate_key};

/// Open a TCP connection and upgrade it, bounded by `Timeouts::handshake`.
///
/// # Errors
///
/// - `Error::Io` if the TCP connection fails
/// - `Error::Timeout` if the upgrade does not finish in time
/// - any error from [`handshake`]
pub async fn connect(
    addr: impl ToSocketAddrs,
    path: &str,
    config: &Config,
) -> Result<Connection<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let host = stream.peer_addr()?.to_string();

    let limit = config.timeouts.handshake;
    tokio::time::timeout(limit, handshake(stream, &host, path, config))
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
}

/// Upgrade an already connected stream.
///
/// Offers permessage-deflate when `config.deflate` is enabled, checks
/// `Sec-WebSocket-Accept`, and validates whatever the server accepted.
///
/// # Errors
///
/// - `Error::InvalidHandshake` for a non-101 answer or a wrong accept key
/// - `Error::InvalidExtension` if the server's extension response is invalid
/// - `Error::HandshakeTooLarge`, `Error::Io`, `Error::ConnectionClosed`
pub async fn handshake<S>(
    mut stream: S,
    host: &str,
    path: &str,
    config: &Config,
) -> Result<Connection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key()?;
    let offer = config
        .deflate
        .enabled
        .then(|| config.deflate.offer().to_string());
    let request = HandshakeRequest::new(host, path, key.as_str(), offer);

    let mut out = Vec::with_capacity(256);
    request.write(&mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head = read_head(&mut stream, &mut buf, config.limits.max_handshake_size).await?;
    let response = HandshakeResponse::parse(&head)?;
    response.verify(&key)?;

    let params = extensions::configure(response.extensions.as_deref(), &config.deflate)?;
    tracing::debug!(
        host,
        path,
        offered = ?request.extensions,
        accepted = ?response.extensions,
        "upgrade complete"
    );
    Ok(Connection::with_leftover(
        stream,
        Role::Client,
        config,
        params,
        buf,
    ))
}
