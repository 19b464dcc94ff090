//! Raw-socket tests: malformed or oversized input must be answered with
//! the matching close code, never with silence.

mod harness;

use bytes::BytesMut;
use harness::TestServer;
use pmdecho::codec::read_head;
use pmdecho::extensions::DeflateParams;
use pmdecho::protocol::{Frame, HandshakeRequest, HandshakeResponse, OpCode};
use pmdecho::{CloseCode, Config, Error, Role};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

/// Upgraded raw socket plus bytes read past the response head.
struct RawClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl RawClient {
    async fn connect(addr: SocketAddr, extensions: Option<&str>) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        HandshakeRequest::new("localhost", "/ws", KEY, extensions.map(str::to_string))
            .write(&mut out)
            .unwrap();
        stream.write_all(&out).await.unwrap();

        let mut buf = BytesMut::new();
        let head = read_head(&mut stream, &mut buf, 8192).await.unwrap();
        let response = HandshakeResponse::parse(&head).unwrap();
        response.verify(KEY).unwrap();
        assert_eq!(response.extensions.is_some(), extensions.is_some());
        Self { stream, buf }
    }

    async fn send(&mut self, frame: &Frame, mask: Option<[u8; 4]>) {
        let mut out = BytesMut::new();
        frame.encode(mask, &mut out);
        self.stream.write_all(&out).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn read_frame(&mut self) -> Frame {
        loop {
            match Frame::parse(&self.buf) {
                Ok((frame, used)) => {
                    let _ = self.buf.split_to(used);
                    return frame;
                }
                Err(Error::IncompleteFrame { .. }) => {
                    let n = tokio::time::timeout(
                        Duration::from_secs(5),
                        self.stream.read_buf(&mut self.buf),
                    )
                    .await
                    .expect("server went silent")
                    .unwrap();
                    assert!(n > 0, "connection closed without a close frame");
                }
                Err(err) => panic!("unparseable server frame: {err}"),
            }
        }
    }

    /// Read the server's close frame, answer it, half-close the socket,
    /// and return the code.
    async fn expect_close(&mut self) -> u16 {
        let frame = self.read_frame().await;
        assert_eq!(frame.opcode, OpCode::Close);
        let payload = frame.payload();
        assert!(payload.len() >= 2);
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        self.send(&Frame::close(Some(code), ""), Some(MASK)).await;
        let _ = self.stream.shutdown().await;
        code
    }
}

#[tokio::test]
async fn test_unmasked_client_frame_closes_with_1002() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, None).await;

    client.send(&Frame::text("no mask"), None).await;
    assert_eq!(client.expect_close().await, CloseCode::ProtocolError.as_u16());

    server.shutdown().await;
}

#[tokio::test]
async fn test_rsv1_without_negotiation_closes_with_1002() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, None).await;

    client
        .send(&Frame::binary(vec![1, 2, 3]).with_rsv1(true), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1002);

    server.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_deflate_stream_closes_with_1002() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, Some("permessage-deflate")).await;

    // 0xFF starts a block with the reserved BTYPE 11.
    client
        .send(&Frame::binary(vec![0xFF; 32]).with_rsv1(true), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1002);

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_closes_with_1007() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, None).await;

    client.send(&Frame::text(vec![0xC3, 0x28]), Some(MASK)).await;
    assert_eq!(client.expect_close().await, CloseCode::InvalidPayload.as_u16());

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_after_inflate_closes_with_1007() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, Some("permessage-deflate")).await;

    let mut deflater = DeflateParams::default().deflater(Role::Client);
    let compressed = deflater.compress(&[0xFF, 0xFE, 0xFD]).unwrap();
    client
        .send(&Frame::text(compressed).with_rsv1(true), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1007);

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_header_closes_with_1009() {
    let (server, addr) = TestServer::spawn_with(Config::server().with_max_message_size(1024)).await;
    let mut client = RawClient::connect(addr, None).await;

    // Binary, FIN, masked, 64-bit length of 32 MiB; no payload follows.
    let mut header = vec![0x82, 0xFF];
    header.extend_from_slice(&(32u64 * 1024 * 1024).to_be_bytes());
    header.extend_from_slice(&MASK);
    client.send_raw(&header).await;
    assert_eq!(client.expect_close().await, CloseCode::MessageTooBig.as_u16());

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_text_and_binary_close_alike() {
    let (server, addr) = TestServer::spawn_with(Config::server().with_max_message_size(1024)).await;

    let mut text = RawClient::connect(addr, None).await;
    text.send(&Frame::text("x".repeat(2048)), Some(MASK)).await;

    let mut binary = RawClient::connect(addr, None).await;
    binary.send(&Frame::binary(vec![b'x'; 2048]), Some(MASK)).await;

    assert_eq!(text.expect_close().await, 1009);
    assert_eq!(binary.expect_close().await, 1009);

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_fragmented_message_closes_with_1009() {
    let (server, addr) = TestServer::spawn_with(Config::server().with_max_message_size(1024)).await;
    let mut client = RawClient::connect(addr, None).await;

    client
        .send(&Frame::new(false, OpCode::Binary, vec![0u8; 600]), Some(MASK))
        .await;
    client
        .send(&Frame::continuation(true, vec![0u8; 600]), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1009);

    server.shutdown().await;
}

#[tokio::test]
async fn test_inflated_size_over_limit_closes_with_1009() {
    let (server, addr) = TestServer::spawn_with(Config::server().with_max_message_size(64 * 1024)).await;
    let mut client = RawClient::connect(addr, Some("permessage-deflate")).await;

    // Compresses to well under the limit, inflates to 1 MiB.
    let mut deflater = DeflateParams::default().deflater(Role::Client);
    let compressed = deflater.compress(&vec![0u8; 1024 * 1024]).unwrap();
    assert!(compressed.len() < 64 * 1024);
    client
        .send(&Frame::binary(compressed).with_rsv1(true), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1009);

    server.shutdown().await;
}

#[tokio::test]
async fn test_continuation_without_start_closes_with_1002() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, None).await;

    client
        .send(&Frame::continuation(true, b"orphan".to_vec()), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1002);

    server.shutdown().await;
}

#[tokio::test]
async fn test_fragmented_ping_closes_with_1002() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, None).await;

    client
        .send(&Frame::new(false, OpCode::Ping, b"p".to_vec()), Some(MASK))
        .await;
    assert_eq!(client.expect_close().await, 1002);

    server.shutdown().await;
}

#[tokio::test]
async fn test_reserved_opcode_closes_with_1002() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, None).await;

    // FIN + opcode 0x3, masked, empty payload.
    let mut raw = vec![0x83, 0x80];
    raw.extend_from_slice(&MASK);
    client.send_raw(&raw).await;
    assert_eq!(client.expect_close().await, 1002);

    server.shutdown().await;
}

#[tokio::test]
async fn test_valid_message_after_ping_is_echoed() {
    let (server, addr) = TestServer::spawn().await;
    let mut client = RawClient::connect(addr, Some("permessage-deflate")).await;

    client.send(&Frame::ping(b"hi".to_vec()), Some(MASK)).await;
    let pong = client.read_frame().await;
    assert_eq!(pong.opcode, OpCode::Pong);
    assert_eq!(pong.payload(), b"hi");

    let params = DeflateParams::default();
    let compressed = params.deflater(Role::Client).compress(b"hello").unwrap();
    client
        .send(&Frame::text(compressed).with_rsv1(true), Some(MASK))
        .await;

    let echo = client.read_frame().await;
    assert_eq!(echo.opcode, OpCode::Text);
    assert!(echo.rsv1);
    let inflated = params
        .inflater(Role::Client)
        .decompress(echo.payload(), 1024)
        .unwrap();
    assert_eq!(inflated, b"hello");

    client.send(&Frame::close(Some(1000), ""), Some(MASK)).await;
    let close = client.read_frame().await;
    assert_eq!(close.opcode, OpCode::Close);
    assert_eq!(&close.payload()[..2], &1000u16.to_be_bytes());

    server.shutdown().await;
}
