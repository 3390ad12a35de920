//! Console logging setup through tracing-subscriber; the rest of the
//! crate logs through the `log` macros.

use std::io::{self, IsTerminal};

use tracing_subscriber::EnvFilter;

pub fn init_logging(verbosity: u8, quiet: bool) {
    let default_filter = if quiet {
        "warn"
    } else {
        match verbosity {
            0 => "info",
            1 => "info,cgfs=debug",
            _ => "trace",
        }
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .without_time()
        .with_target(false)
        .init();
}
