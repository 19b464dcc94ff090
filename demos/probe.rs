//! Large-message probe against an echo endpoint.
//!
//! Run with: cargo run --example probe -- [ADDR]
//!
//! Without an address an in-process echo server is started for each
//! scenario. Environment overrides:
//!
//! - `PMDECHO_PAYLOAD_SIZE`: generated bytes per message (default 4 MiB)
//! - `PMDECHO_TIMEOUT_MS`: deadline per scenario (default 3000)
//!
//! Exits non-zero when a scenario fails.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use pmdecho::harness::{self, SERVER_TEXT_LIMIT};
use pmdecho::{CloseCode, Config, ProbeConfig, ProbeOutcome};
use tracing_subscriber::EnvFilter;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn with_overrides(probe: ProbeConfig) -> ProbeConfig {
    let size = env_or("PMDECHO_PAYLOAD_SIZE", probe.payload_size);
    let timeout_ms = env_or("PMDECHO_TIMEOUT_MS", probe.timeout.as_millis() as u64);
    probe
        .with_payload_size(size)
        .with_timeout(Duration::from_millis(timeout_ms))
}

async fn run(
    target: Option<SocketAddr>,
    server: Config,
    probe: &ProbeConfig,
) -> Result<ProbeOutcome, pmdecho::Error> {
    match target {
        Some(addr) => Ok(harness::run_probe(addr, probe).await),
        None => harness::run_scenario(server, probe).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let target = match std::env::args().nth(1).map(|a| a.parse::<SocketAddr>()) {
        None => None,
        Some(Ok(addr)) => Some(addr),
        Some(Err(err)) => {
            eprintln!("invalid address: {err}");
            return ExitCode::from(2);
        }
    };

    let mut failed = false;

    let binary = with_overrides(ProbeConfig::large_binary());
    match run(target, Config::server(), &binary).await {
        Ok(outcome) => {
            println!("binary: {outcome}");
            failed |= !outcome.is_echoed();
        }
        Err(err) => {
            println!("binary: could not start: {err}");
            failed = true;
        }
    }

    // An echo is fine when the text fits the limit; otherwise a 1009 close
    // is expected. A timeout always fails.
    let text = with_overrides(ProbeConfig::large_text());
    let server = Config::server().with_max_message_size(SERVER_TEXT_LIMIT);
    match run(target, server, &text).await {
        Ok(outcome) => {
            println!("text: {outcome}");
            let ok = outcome.is_echoed() || outcome.close_code() == Some(CloseCode::MessageTooBig);
            failed |= !ok;
        }
        Err(err) => {
            println!("text: could not start: {err}");
            failed = true;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
