//! Tracing initialization.
//!
//! Every binary in the workspace installs the same subscriber so logs line
//! up when a caller, a callee and the rendezvous server run side by side.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// - `RUST_LOG` wins when set; otherwise `default_directive` applies
///   (e.g. `"info"` or `"info,media=debug"`).
/// - ANSI color on stderr is controlled by `ColorWhen`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen, default_directive: &str) -> Result<()> {
    // ---
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
