//! Standalone permessage-deflate echo server.
//!
//! Run with: cargo run --example echo_server -- 127.0.0.1:9001
//! Then probe it with: cargo run --example probe -- 127.0.0.1:9001
//!
//! `PMDECHO_MAX_MESSAGE` overrides the server's message limit (bytes).

use std::error::Error;

use pmdecho::{Config, EchoServer};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:9001";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let mut config = Config::server();
    if let Some(limit) = std::env::var("PMDECHO_MAX_MESSAGE")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config = config.with_max_message_size(limit);
    }

    let server = EchoServer::bind(addr.as_str(), config).await?;
    println!("echo server listening on {}", server.url());

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    server.shutdown().await;
    Ok(())
}
