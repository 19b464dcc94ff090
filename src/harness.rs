//! Large-message probe: send one deterministic payload to an echo endpoint
//! and classify what comes back.
//!
//! Every outcome is reported distinctly: an equal echo, a corrupted echo, a
//! close or error before the echo, and silence until the deadline. Silence
//! is never reported as a close.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::client;
use crate::config::Config;
use crate::connection::WsReceiver;
use crate::error::{Error, Result};
use crate::message::{CloseCode, Message};
use crate::server::{DEFAULT_PATH, EchoServer};

/// Payload size used by both large-message scenarios: 4 MiB.
pub const DEFAULT_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Seed for the payload generator.
pub const DEFAULT_SEED: u64 = 42;

/// How long the probe waits for the echo.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Message limit the text scenario puts on the server: 5 MiB.
pub const SERVER_TEXT_LIMIT: usize = 5 * 1024 * 1024;

/// Which message type carries the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// The raw generated bytes.
    Binary,
    /// The lossy UTF-8 decoding of the generated bytes.
    Text,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadKind::Binary => "binary",
            PayloadKind::Text => "text",
        })
    }
}

/// Probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Generated byte count before any text decoding.
    ///
    /// Default: 4 MiB
    pub payload_size: usize,

    /// Generator seed.
    ///
    /// Default: 42
    pub seed: u64,

    /// Message type.
    ///
    /// Default: binary
    pub kind: PayloadKind,

    /// Deadline for connecting, sending and receiving the echo.
    ///
    /// Default: 3 seconds
    pub timeout: Duration,

    /// Upgrade path.
    ///
    /// Default: `/ws`
    pub path: String,

    /// Client connection settings.
    pub client: Config,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            payload_size: DEFAULT_PAYLOAD_SIZE,
            seed: DEFAULT_SEED,
            kind: PayloadKind::Binary,
            timeout: DEFAULT_TIMEOUT,
            path: DEFAULT_PATH.to_string(),
            client: Config::client(),
        }
    }
}

impl ProbeConfig {
    /// 4 MiB binary payload, seed 42, 3 second deadline.
    #[must_use]
    pub fn large_binary() -> Self {
        Self::default()
    }

    /// Same bytes as [`ProbeConfig::large_binary`], sent as text.
    #[must_use]
    pub fn large_text() -> Self {
        Self::default().with_kind(PayloadKind::Text)
    }

    /// Set the payload size.
    #[must_use]
    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Set the generator seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the message type.
    #[must_use]
    pub fn with_kind(mut self, kind: PayloadKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the upgrade path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the client connection settings.
    #[must_use]
    pub fn with_client_config(mut self, config: Config) -> Self {
        self.client = config;
        self
    }

    /// The message this probe sends.
    #[must_use]
    pub fn message(&self) -> Message {
        let bytes = generate_payload(self.payload_size, self.seed);
        match self.kind {
            PayloadKind::Binary => Message::Binary(bytes),
            PayloadKind::Text => Message::Text(text_payload(&bytes)),
        }
    }
}

/// `size` bytes from a ChaCha8 stream seeded with `seed`.
#[must_use]
pub fn generate_payload(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut bytes = vec![0u8; size];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Lossy UTF-8 decoding: every invalid sequence becomes U+FFFD, so the
/// encoded text is usually larger than the input.
#[must_use]
pub fn text_payload(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// How a probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProbeOutcome {
    /// The echo matched what was sent.
    Echoed {
        /// Payload bytes.
        len: usize,
        /// Time from connect to echo.
        elapsed: Duration,
    },
    /// An echo arrived but differs.
    Corrupted {
        /// Bytes sent.
        sent_len: usize,
        /// Bytes received.
        received_len: usize,
        /// First differing offset; `None` when only the message type differs.
        first_difference: Option<usize>,
        /// Whether the echo came back as the same message type.
        kind_matches: bool,
    },
    /// The peer closed before echoing.
    Closed {
        /// Close code, if the close frame carried one.
        code: Option<CloseCode>,
        /// Close reason.
        reason: String,
    },
    /// Connecting or the connection itself failed.
    Failed {
        /// What went wrong.
        error: Error,
    },
    /// Nothing conclusive before the deadline.
    TimedOut {
        /// The deadline that elapsed.
        after: Duration,
    },
}

impl ProbeOutcome {
    /// Whether the echo matched.
    #[must_use]
    pub fn is_echoed(&self) -> bool {
        matches!(self, ProbeOutcome::Echoed { .. })
    }

    /// Whether the deadline elapsed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeOutcome::TimedOut { .. })
    }

    /// Close code observed by the client, if the connection was closed.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            ProbeOutcome::Closed { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Echoed { len, elapsed } => {
                write!(f, "echoed {len} bytes in {} ms", elapsed.as_millis())
            }
            ProbeOutcome::Corrupted {
                sent_len,
                received_len,
                first_difference,
                kind_matches,
            } => {
                write!(f, "corrupted echo: sent {sent_len} bytes, got {received_len}")?;
                if let Some(offset) = first_difference {
                    write!(f, ", first difference at {offset}")?;
                }
                if !kind_matches {
                    f.write_str(", message type changed")?;
                }
                Ok(())
            }
            ProbeOutcome::Closed { code: Some(code), reason } => {
                write!(f, "closed with {code} {reason:?}")
            }
            ProbeOutcome::Closed { code: None, .. } => f.write_str("closed without a status"),
            ProbeOutcome::Failed { error } => write!(f, "failed: {error}"),
            ProbeOutcome::TimedOut { after } => {
                write!(f, "timed out after {} ms", after.as_millis())
            }
        }
    }
}

/// What the reading task saw first.
enum Received {
    Message(Message),
    Closed(Option<crate::message::CloseFrame>),
    Failed(Error),
}

/// Run one probe against an endpoint at `addr`.
pub async fn run_probe(addr: SocketAddr, config: &ProbeConfig) -> ProbeOutcome {
    let message = config.message();
    let deadline = tokio::time::Instant::now() + config.timeout;
    let started = Instant::now();

    let connected = tokio::time::timeout_at(
        deadline,
        client::connect(addr, &config.path, &config.client),
    )
    .await;
    let conn = match connected {
        Ok(Ok(conn)) => conn,
        Ok(Err(error)) => return ProbeOutcome::Failed { error },
        Err(_) => return ProbeOutcome::TimedOut {
            after: config.timeout,
        },
    };
    tracing::info!(
        %addr,
        kind = %config.kind,
        len = message.len(),
        compression = conn.negotiated().is_some(),
        "probe connected"
    );

    let (mut sender, receiver) = conn.split();
    let (done_tx, done_rx) = oneshot::channel();
    let reader = tokio::spawn(async move {
        let mut receiver = receiver;
        let received = first_message(&mut receiver).await;
        let _ = done_tx.send(received);
        receiver
    });

    let expected = message.clone();
    let exchange = async {
        if let Err(err) = sender.send(message).await {
            tracing::debug!(error = %err, "probe send ended early");
        }
        done_rx.await
    };

    let outcome = match tokio::time::timeout_at(deadline, exchange).await {
        Err(_) => {
            reader.abort();
            ProbeOutcome::TimedOut {
                after: config.timeout,
            }
        }
        Ok(Err(_)) => ProbeOutcome::Failed {
            error: Error::ConnectionClosed(None),
        },
        Ok(Ok(Received::Closed(frame))) => ProbeOutcome::Closed {
            code: frame.as_ref().map(|f| f.code),
            reason: frame.map(|f| f.reason).unwrap_or_default(),
        },
        Ok(Ok(Received::Failed(error))) => ProbeOutcome::Failed { error },
        Ok(Ok(Received::Message(echo))) => {
            let outcome = compare(&expected, &echo, started.elapsed());
            if let Ok(mut receiver) = reader.await {
                if sender.close(CloseCode::Normal, "probe done").await.is_ok() {
                    receiver.await_close().await;
                }
            }
            outcome
        }
    };

    tracing::info!(%addr, kind = %config.kind, %outcome, "probe finished");
    outcome
}

async fn first_message(receiver: &mut WsReceiver<TcpStream>) -> Received {
    loop {
        match receiver.recv().await {
            Ok(Some(Message::Ping(_) | Message::Pong(_))) => {}
            Ok(Some(Message::Close(frame))) => return Received::Closed(frame),
            Ok(Some(message)) => return Received::Message(message),
            Ok(None) => return Received::Closed(None),
            Err(err) => return Received::Failed(err),
        }
    }
}

fn compare(sent: &Message, received: &Message, elapsed: Duration) -> ProbeOutcome {
    if sent == received {
        return ProbeOutcome::Echoed {
            len: sent.len(),
            elapsed,
        };
    }
    let (a, b) = (sent.as_bytes(), received.as_bytes());
    let first_difference = a
        .iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())));
    ProbeOutcome::Corrupted {
        sent_len: a.len(),
        received_len: b.len(),
        first_difference,
        kind_matches: sent.kind() == received.kind(),
    }
}

/// Start an echo server on an ephemeral port, run one probe against it and
/// shut the server down.
///
/// # Errors
///
/// Returns `Error::Io` if the server cannot be bound; probe failures are
/// reported in the outcome.
pub async fn run_scenario(server: Config, probe: &ProbeConfig) -> Result<ProbeOutcome> {
    let server = EchoServer::bind_path("127.0.0.1:0", &probe.path, server).await?;
    let outcome = run_probe(server.local_addr(), probe).await;
    server.shutdown().await;
    Ok(outcome)
}
