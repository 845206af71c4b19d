#![cfg_attr(test, allow(clippy::unwrap_used))]

mod err_chain;

use anyhow::{Context as _, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{filter::ParseError, fmt, util::SubscriberInitExt as _, EnvFilter};

pub use err_chain::{err_with_src, ErrChain};

/// Registers a global stdout subscriber, filtered by `RUST_LOG`.
pub fn setup_global_subscriber() -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_default();

    let subscriber = fmt()
        .with_env_filter(try_filter(&directives).context("Failed to parse directives")?)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
///
/// A catch-all directive like `debug` is useful for debugging but floods the
/// output with frames from the websocket and TLS stacks. Prepending this list
/// keeps such directives usable; restate a crate with a lower filter to
/// re-enable it, e.g. `tungstenite=trace`.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    const IRRELEVANT_CRATES: &str = "tungstenite=warn,tokio_tungstenite=warn,rustls=warn";

    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

pub fn test_global(directives: &str) {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(directives)
            .finish(),
    )
    .ok();
}
