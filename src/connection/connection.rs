use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::{Config, Limits};
use crate::connection::fragmenter::MessageFragmenter;
use crate::connection::state::SharedState;
use crate::connection::{ConnectionState, Role};
use crate::error::{Error, Result};
use crate::extensions::{DeflateParams, Deflater};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::{AssemblerState, Frame, MessageAssembler, OpCode};

type SharedWriter<T> = Arc<Mutex<FrameWriter<WriteHalf<T>>>>;

/// An established WebSocket session over an async byte stream.
///
/// Created by [`crate::client::connect`] or the echo server after a
/// successful upgrade. Compression state, limits and the assembler are
/// local to the connection. Use [`Connection::split`] to read and write
/// from separate tasks.
///
/// ```rust,ignore
/// let mut conn = pmdecho::client::connect(addr, "/ws", Config::client()).await?;
/// conn.send(Message::binary(payload)).await?;
/// let echo = conn.recv().await?;
/// conn.close(CloseCode::Normal, "done").await?;
/// ```
pub struct Connection<T> {
    sender: WsSender<T>,
    receiver: WsReceiver<T>,
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.sender.role)
            .field("state", &self.sender.state.get())
            .field("compression", &self.sender.params)
            .finish_non_exhaustive()
    }
}

impl<T: AsyncRead + AsyncWrite> Connection<T> {
    /// Wrap a stream whose handshake has already completed.
    pub fn new(io: T, role: Role, config: &Config, params: Option<DeflateParams>) -> Self {
        Self::with_leftover(io, role, config, params, BytesMut::new())
    }

    /// Like [`Connection::new`], with bytes that were read past the
    /// handshake head and belong to the first frame.
    pub fn with_leftover(
        io: T,
        role: Role,
        config: &Config,
        params: Option<DeflateParams>,
        leftover: BytesMut,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let state = SharedState::default();
        let writer = Arc::new(Mutex::new(FrameWriter::new(write_half, role, config)));

        let reader = FrameReader::new(read_half, role, config, leftover)
            .with_compression(params.is_some());
        let inflater = params.map(|p| p.inflater(role));

        Self {
            sender: WsSender {
                writer: Arc::clone(&writer),
                deflater: params.map(|p| p.deflater(role)),
                params,
                state: state.clone(),
                limits: config.limits.clone(),
                fragment_size: config.fragment_size,
                role,
            },
            receiver: WsReceiver {
                reader,
                writer,
                assembler: MessageAssembler::new(config.limits.clone(), inflater),
                state,
                role,
                close_timeout: config.timeouts.close,
                finished: false,
            },
        }
    }
}

impl<T> Connection<T> {
    /// Local role.
    pub fn role(&self) -> Role {
        self.sender.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.sender.state.get()
    }

    /// Negotiated permessage-deflate parameters, if any.
    pub fn negotiated(&self) -> Option<&DeflateParams> {
        self.sender.params.as_ref()
    }

    /// State of the incoming message assembler.
    pub fn assembler_state(&self) -> AssemblerState {
        self.receiver.assembler_state()
    }

    /// Separate the write and read paths so they can run on different tasks.
    pub fn split(self) -> (WsSender<T>, WsReceiver<T>) {
        (self.sender, self.receiver)
    }
}

impl<T: AsyncRead + AsyncWrite> Connection<T> {
    /// See [`WsSender::send`].
    ///
    /// # Errors
    ///
    /// As [`WsSender::send`].
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    /// See [`WsReceiver::recv`].
    ///
    /// # Errors
    ///
    /// As [`WsReceiver::recv`].
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.receiver.recv().await
    }

    /// Send a close frame and wait, bounded by `Timeouts::close`, for the
    /// peer's reply. Messages that arrive meanwhile are discarded.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCloseCode` for codes that may not appear on the wire
    /// - `Error::Io` if the close frame cannot be written
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.sender.close(code, reason).await?;
        self.receiver.await_close().await;
        Ok(())
    }
}

/// Write path of a connection.
pub struct WsSender<T> {
    writer: SharedWriter<T>,
    deflater: Option<Deflater>,
    params: Option<DeflateParams>,
    state: SharedState,
    limits: Limits,
    fragment_size: usize,
    role: Role,
}

impl<T> std::fmt::Debug for WsSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSender")
            .field("role", &self.role)
            .field("state", &self.state.get())
            .field("deflater", &self.deflater)
            .finish_non_exhaustive()
    }
}

impl<T: AsyncWrite> WsSender<T> {
    /// Current lifecycle state, shared with the receiver.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Send a message.
    ///
    /// Data messages are compressed as a whole when permessage-deflate is
    /// active, then fragmented by `Config::fragment_size`; only the first
    /// frame carries RSV1. The writer is locked per frame, so the receiver
    /// can slip a pong or close reply between fragments.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionClosed` once a close frame was sent or received
    /// - `Error::MessageTooLarge` if the payload exceeds
    ///   `Limits::max_message_size`; a 1009 close is sent as well
    /// - `Error::ControlFrameTooLarge` for ping or pong payloads over 125 bytes
    /// - `Error::Compression` or `Error::Io` from the write path
    pub async fn send(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_data(OpCode::Text, Bytes::from(text)).await,
            Message::Binary(data) => self.send_data(OpCode::Binary, Bytes::from(data)).await,
            Message::Ping(data) => self.send_control(Frame::ping(data)).await,
            Message::Pong(data) => self.send_control(Frame::pong(data)).await,
            Message::Close(Some(CloseFrame { code, reason })) => self.close(code, &reason).await,
            Message::Close(None) => {
                send_close(&self.writer, &self.state, None, "").await?;
                Ok(())
            }
        }
    }

    /// Send a close frame without waiting for the reply; the receiver
    /// completes the handshake. A no-op once closing.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCloseCode` for codes that may not appear on the wire
    /// - `Error::Io` if the frame cannot be written
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if !code.is_valid() {
            return Err(Error::InvalidCloseCode(code.as_u16()));
        }
        send_close(&self.writer, &self.state, Some(code), reason).await?;
        Ok(())
    }

    async fn send_data(&mut self, opcode: OpCode, payload: Bytes) -> Result<()> {
        if !self.state.get().can_send() {
            return Err(Error::ConnectionClosed(None));
        }
        if let Err(err) = self.limits.check_message_size(payload.len()) {
            tracing::warn!(
                role = %self.role,
                len = payload.len(),
                max = self.limits.max_message_size,
                "outgoing message exceeds limit"
            );
            if let Err(close_err) = send_close(
                &self.writer,
                &self.state,
                Some(CloseCode::MessageTooBig),
                "message too big",
            )
            .await
            {
                tracing::debug!(role = %self.role, error = %close_err, "close frame not sent");
            }
            return Err(err);
        }

        let original_len = payload.len();
        let (payload, compressed) = match self.deflater.as_mut() {
            Some(deflater) => (Bytes::from(deflater.compress(&payload)?), true),
            None => (payload, false),
        };
        tracing::trace!(
            role = %self.role,
            opcode = %opcode,
            len = original_len,
            wire_len = payload.len(),
            compressed,
            "sending message"
        );

        for frame in MessageFragmenter::new(payload, opcode, compressed, self.fragment_size) {
            let mut writer = self.writer.lock().await;
            if !self.state.get().can_send() {
                return Err(Error::ConnectionClosed(None));
            }
            writer.write_frame(&frame).await?;
        }
        self.writer.lock().await.flush().await
    }

    async fn send_control(&mut self, frame: Frame) -> Result<()> {
        frame.validate()?;
        let mut writer = self.writer.lock().await;
        if !self.state.get().can_send() {
            return Err(Error::ConnectionClosed(None));
        }
        writer.write_frame(&frame).await?;
        writer.flush().await
    }
}

/// Read path of a connection: reassembles messages, answers pings and
/// completes the close handshake.
pub struct WsReceiver<T> {
    reader: FrameReader<ReadHalf<T>>,
    writer: SharedWriter<T>,
    assembler: MessageAssembler,
    state: SharedState,
    role: Role,
    close_timeout: Duration,
    finished: bool,
}

impl<T> std::fmt::Debug for WsReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsReceiver")
            .field("role", &self.role)
            .field("state", &self.state.get())
            .field("assembler", &self.assembler.state())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> WsReceiver<T> {
    /// State of the incoming message assembler.
    pub fn assembler_state(&self) -> AssemblerState {
        self.assembler.state()
    }

    /// Current lifecycle state, shared with the sender.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl<T: AsyncRead + AsyncWrite> WsReceiver<T> {
    /// Receive the next message.
    ///
    /// Pings are answered automatically and still surfaced. A peer close is
    /// answered and returned as `Message::Close`; after that, and after EOF,
    /// `Ok(None)` is returned.
    ///
    /// On a protocol or limit error the matching close frame (1002, 1007 or
    /// 1009) is sent, incoming frames are drained until the peer's close
    /// arrives or `Timeouts::close` elapses, and the error is returned once.
    ///
    /// # Errors
    ///
    /// Any frame, assembly, decompression or transport error.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        if self.finished {
            return Ok(None);
        }
        match self.next_message().await {
            Ok(Some(message)) => {
                if matches!(message, Message::Close(_)) {
                    self.finished = true;
                }
                Ok(Some(message))
            }
            Ok(None) => {
                self.finished = true;
                self.state.set(ConnectionState::Closed);
                Ok(None)
            }
            Err(err) => {
                self.finished = true;
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            let frame = match self.reader.read_frame().await {
                Ok(frame) => frame,
                Err(Error::ConnectionClosed(_)) => {
                    tracing::debug!(role = %self.role, "transport closed");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };

            match frame.opcode {
                OpCode::Ping => {
                    frame.validate()?;
                    let payload = frame.into_payload();
                    self.reply(Frame::pong(payload.clone())).await?;
                    return Ok(Some(Message::Ping(payload.to_vec())));
                }
                OpCode::Pong => {
                    frame.validate()?;
                    return Ok(Some(Message::Pong(frame.into_payload().to_vec())));
                }
                OpCode::Close => {
                    frame.validate()?;
                    let close = parse_close_payload(frame.payload())?;
                    self.complete_close(close.as_ref()).await;
                    return Ok(Some(Message::Close(close)));
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if let Some(assembled) = self.assembler.push(frame)? {
                        tracing::trace!(
                            role = %self.role,
                            kind = assembled.message.kind(),
                            len = assembled.message.len(),
                            wire_len = assembled.wire_len,
                            compressed = assembled.compressed,
                            "message assembled"
                        );
                        return Ok(Some(assembled.message));
                    }
                }
            }
        }
    }

    async fn reply(&mut self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.state.get().can_send() {
            writer.write_frame(&frame).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    async fn complete_close(&mut self, close: Option<&CloseFrame>) {
        let code = close.map(|c| c.code.as_u16());
        if self
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            tracing::debug!(role = %self.role, ?code, "peer closed, replying");
            let reply = Frame::close(code, "");
            let mut writer = self.writer.lock().await;
            if writer.write_frame(&reply).await.is_ok() {
                let _ = writer.flush().await;
            }
        } else {
            tracing::debug!(role = %self.role, ?code, "close handshake complete");
        }
        self.state.set(ConnectionState::Closed);
        let _ = self.writer.lock().await.shutdown().await;
    }

    async fn fail(&mut self, err: &Error) {
        let Some(code) = err.close_code() else {
            tracing::debug!(role = %self.role, error = %err, "connection lost");
            self.state.set(ConnectionState::Closed);
            return;
        };

        tracing::warn!(
            role = %self.role,
            code = code.as_u16(),
            error = %err,
            "failing connection"
        );
        if let Err(write_err) =
            send_close(&self.writer, &self.state, Some(code), &err.to_string()).await
        {
            tracing::debug!(role = %self.role, error = %write_err, "close frame not sent");
            self.state.set(ConnectionState::Closed);
            return;
        }
        self.drain().await;
    }

    /// Wait for the peer's close after ours was sent.
    pub(crate) async fn await_close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.drain().await;
    }

    async fn drain(&mut self) {
        let reader = &mut self.reader;
        let drained = tokio::time::timeout(self.close_timeout, async {
            loop {
                match reader.read_frame().await {
                    Ok(frame) if frame.opcode == OpCode::Close => return,
                    Ok(_) => {}
                    Err(Error::ConnectionClosed(_)) => return,
                    Err(_) => {
                        let _ = reader.skip_to_eof().await;
                        return;
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!(role = %self.role, "peer did not answer close in time");
        }
        self.state.set(ConnectionState::Closed);
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Send a close frame if the connection is still open. Returns whether a
/// frame was written.
async fn send_close<T: AsyncWrite>(
    writer: &SharedWriter<T>,
    state: &SharedState,
    code: Option<CloseCode>,
    reason: &str,
) -> Result<bool> {
    if !state.transition(ConnectionState::Open, ConnectionState::Closing) {
        return Ok(false);
    }
    let frame = Frame::close(code.map(|c| c.as_u16()), reason);
    let mut writer = writer.lock().await;
    writer.write_frame(&frame).await?;
    writer.flush().await?;
    Ok(true)
}

/// Decode a close payload: empty, or a valid code plus a UTF-8 reason.
fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>> {
    match payload {
        [] => Ok(None),
        [_] => Err(Error::ProtocolViolation(
            "close frame with a one-byte payload".into(),
        )),
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from_u16(u16::from_be_bytes([*hi, *lo]));
            if !code.is_valid() {
                return Err(Error::InvalidCloseCode(code.as_u16()));
            }
            let reason = std::str::from_utf8(reason)?;
            Ok(Some(CloseFrame::new(code, reason)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::DeflateConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair(
        client_config: &Config,
        server_config: &Config,
        params: Option<DeflateParams>,
    ) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(a, Role::Client, client_config, params),
            Connection::new(b, Role::Server, server_config, params),
        )
    }

    fn deflate() -> Option<DeflateParams> {
        Some(DeflateParams::default())
    }

    #[tokio::test]
    async fn test_text_roundtrip_plain_and_compressed() {
        for params in [None, deflate()] {
            let (mut client, mut server) = pair(&Config::client(), &Config::server(), params);
            client.send(Message::text("héllo wörld")).await.unwrap();
            assert_eq!(
                server.recv().await.unwrap(),
                Some(Message::text("héllo wörld"))
            );
            assert_eq!(server.assembler_state(), AssemblerState::Complete);
        }
    }

    #[tokio::test]
    async fn test_compressed_fragments_roundtrip() {
        let config = Config::client().with_fragment_size(7);
        let (client, server) = pair(&config, &Config::server(), deflate());
        let (mut tx, _rx) = client.split();
        let (_stx, mut srx) = server.split();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let send = tokio::spawn(async move { tx.send(Message::binary(payload)).await });

        assert_eq!(srx.recv().await.unwrap(), Some(Message::Binary(expected)));
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (mut client, mut server) = pair(&Config::client(), &Config::server(), None);
        client.send(Message::ping(b"abc".to_vec())).await.unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            Some(Message::Ping(b"abc".to_vec()))
        );
        assert_eq!(
            client.recv().await.unwrap(),
            Some(Message::Pong(b"abc".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (mut client, mut server) = pair(&Config::client(), &Config::server(), None);
        let server_task = tokio::spawn(async move {
            let msg = server.recv().await.unwrap();
            let after = server.recv().await.unwrap();
            (msg, after, server.state())
        });

        client.close(CloseCode::Normal, "done").await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);

        let (msg, after, state) = server_task.await.unwrap();
        assert_eq!(msg, Some(Message::close(CloseCode::Normal, "done")));
        assert_eq!(after, None);
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(
            client.send(Message::text("late")).await,
            Err(Error::ConnectionClosed(None))
        );
    }

    #[tokio::test]
    async fn test_oversize_receive_closes_with_1009() {
        for message in [Message::binary(vec![b'a'; 200]), Message::text("a".repeat(200))] {
            let server_config = Config::server().with_max_message_size(100);
            let (mut client, mut server) = pair(&Config::client(), &server_config, deflate());

            let server_task = tokio::spawn(async move {
                let err = server.recv().await.unwrap_err();
                (err, server.recv().await, server.assembler_state())
            });

            client.send(message).await.unwrap();
            match client.recv().await.unwrap() {
                Some(Message::Close(Some(cf))) => assert_eq!(cf.code, CloseCode::MessageTooBig),
                other => panic!("expected close, got {other:?}"),
            }
            assert_eq!(client.recv().await, Ok(None));

            let (err, after, state) = server_task.await.unwrap();
            assert!(matches!(err, Error::MessageTooLarge { max: 100, .. }));
            assert_eq!(after, Ok(None));
            assert_eq!(state, AssemblerState::Failed);
        }
    }

    #[tokio::test]
    async fn test_oversize_send_rejected() {
        let client_config = Config::client().with_max_message_size(10);
        let (mut client, mut server) = pair(&client_config, &Config::server(), None);

        assert!(matches!(
            client.send(Message::binary(vec![0; 11])).await,
            Err(Error::MessageTooLarge { size: 11, max: 10 })
        ));
        match server.recv().await.unwrap() {
            Some(Message::Close(Some(cf))) => assert_eq!(cf.code, CloseCode::MessageTooBig),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_send_with_peer_gone_reports_limit() {
        let client_config = Config::client().with_max_message_size(10);
        let (mut client, server) = pair(&client_config, &Config::server(), None);
        drop(server);

        assert!(matches!(
            client.send(Message::binary(vec![0; 11])).await,
            Err(Error::MessageTooLarge { size: 11, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_empty_messages_keep_compressed_stream_in_sync() {
        let (mut client, mut server) = pair(&Config::client(), &Config::server(), deflate());
        let sequence: [Vec<u8>; 5] = [vec![], vec![], vec![1], vec![], vec![2, 3]];

        for payload in &sequence {
            client.send(Message::binary(payload.clone())).await.unwrap();
            let echoed = server.recv().await.unwrap().unwrap();
            assert_eq!(echoed, Message::binary(payload.clone()));
            server.send(echoed).await.unwrap();
        }
        for payload in &sequence {
            assert_eq!(
                client.recv().await.unwrap(),
                Some(Message::binary(payload.clone()))
            );
        }
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_gets_1002() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let mut server = Connection::new(b, Role::Server, &Config::server(), None);
        let server_task = tokio::spawn(async move {
            let err = server.recv().await.unwrap_err();
            (err, server.recv().await)
        });

        raw.write_all(&[0x81, 0x02, b'H', b'i']).await.unwrap();
        let mut head = [0u8; 4];
        raw.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x88);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 1002);
        drop(raw);

        let (err, after) = server_task.await.unwrap();
        assert_eq!(err, Error::UnmaskedClientFrame);
        assert_eq!(after, Ok(None));
    }

    #[test]
    fn test_invalid_close_payloads() {
        assert_eq!(parse_close_payload(&[]), Ok(None));
        assert!(parse_close_payload(&[0x03]).is_err());
        assert_eq!(
            parse_close_payload(&[0x03, 0xed]),
            Err(Error::InvalidCloseCode(1005))
        );
        assert_eq!(
            parse_close_payload(&[0x03, 0xe8, 0xff]),
            Err(Error::InvalidUtf8)
        );
        assert_eq!(
            parse_close_payload(&[0x03, 0xf1, b'b', b'i', b'g']),
            Ok(Some(CloseFrame::new(CloseCode::MessageTooBig, "big")))
        );
    }

    #[tokio::test]
    async fn test_deflate_config_disabled_means_plain_frames() {
        let params = crate::extensions::negotiate(
            Some("permessage-deflate"),
            &DeflateConfig::disabled(),
        )
        .params;
        let (mut client, mut server) = pair(&Config::client(), &Config::server(), params);
        assert!(client.negotiated().is_none());
        client.send(Message::binary(vec![7; 64])).await.unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            Some(Message::Binary(vec![7; 64]))
        );
    }
}
