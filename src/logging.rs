//! Tracing subscriber setup for the binary

use anyhow::{Context, Result};
use std::io::{self, IsTerminal};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter for a verbosity level (`-v` count)
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "simpo=info,warn",
        1 => "simpo=debug,info",
        2 => "simpo=trace,debug",
        _ => "trace",
    }
}

/// Install a global subscriber. `RUST_LOG` wins over `verbosity` when set.
pub fn init_logging(verbosity: u8, json_output: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry()
            .with(json_layer)
            .try_init()
            .context("failed to install JSON log subscriber")?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry()
            .with(fmt_layer)
            .try_init()
            .context("failed to install log subscriber")?;
    }

    Ok(())
}
