//! Log subscriber setup for the `bpfmon` CLI.
//!
//! bpfmon keeps two streams apart: stdout carries only command results
//! (probe listings, batch summaries, rendered reports, `--json` output), and
//! every log line goes to stderr next to the progress ticks. Piping
//! `bpfmon report --print` or `bpfmon run --json` into another tool therefore
//! never picks up log noise. Verbosity comes from `RUST_LOG` when set,
//! otherwise from the `--verbose` flag passed in as `level`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the stderr subscriber, as JSON lines when `json` is set.
///
/// Only the first call installs anything; later calls are ignored so tests
/// and the CLI can both call it.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
