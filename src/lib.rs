//! # pmdecho - permessage-deflate echo endpoint and large-message probe
//!
//! A self-contained RFC 6455 endpoint with RFC 7692 compression, built to
//! reproduce and rule out defects in how large compressed messages are
//! assembled, size-checked and echoed.
//!
//! ## Features
//!
//! - **Frame codec** with RSV1 and all three payload length forms
//! - **permessage-deflate** negotiation with context takeover and window bits
//! - **Message assembler** with identical limits for text and binary
//! - **Echo server** on an ephemeral port with explicit shutdown
//! - **Probe** that tells an echo, corruption, a close and a timeout apart
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pmdecho::{Config, EchoServer};
//! use pmdecho::harness::{ProbeConfig, run_probe};
//!
//! let server = EchoServer::bind("127.0.0.1:0", Config::server()).await?;
//! let outcome = run_probe(server.local_addr(), &ProbeConfig::large_binary()).await;
//! assert!(outcome.is_echoed());
//! server.shutdown().await;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod harness;
pub mod message;
pub mod protocol;
pub mod server;

pub use config::{Config, Limits, Timeouts};
pub use connection::{Connection, ConnectionState, Role, WsReceiver, WsSender};
pub use error::{Error, Result};
pub use extensions::{DeflateConfig, DeflateParams};
pub use harness::{PayloadKind, ProbeConfig, ProbeOutcome};
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::{AssemblerState, Frame, OpCode};
pub use server::EchoServer;
