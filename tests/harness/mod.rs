//! Shared utilities for integration tests.
//!
//! Spawns echo servers on ephemeral ports and wraps client connections
//! with helpers for the common send/receive patterns.

#![allow(dead_code)]

mod client;
mod server;

pub use client::TestClient;
pub use server::TestServer;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary; `RUST_LOG` controls output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
