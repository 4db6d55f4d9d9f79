//! Tracing subscriber setup
//!
//! Log lines from every worker, the monitor, and trigger threads go to stderr
//! through one mutex-guarded writer, so lines never interleave. `RUST_LOG`
//! overrides the level chosen on the command line.

use crate::Result;
use std::io::Stderr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Level for a `-v` count: info by default, debug for one, trace beyond
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn build_env_filter(verbosity: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(level_for(verbosity).to_string())
}

/// Install the global subscriber
///
/// `debug` adds thread names and source locations to every line.
pub fn init(verbosity: u8, debug: bool) -> Result<()> {
    let filter = build_env_filter(verbosity);
    let writer: Mutex<Stderr> = Mutex::new(std::io::stderr());

    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_target(debug)
        .with_thread_names(debug)
        .with_file(debug)
        .with_line_number(debug);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(level_for(0), Level::INFO);
        assert_eq!(level_for(1), Level::DEBUG);
        assert_eq!(level_for(5), Level::TRACE);
    }
}
