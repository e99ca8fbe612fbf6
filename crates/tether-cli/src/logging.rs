use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

/// Pick the log filter: `--log-level` wins, then `--verbose`, then `RUST_LOG`,
/// falling back to warnings only.
pub fn filter(log_level: Option<LogLevel>, verbose: bool) -> EnvFilter {
    match (log_level, verbose) {
        (Some(level), _) => EnvFilter::default().add_directive(LevelFilter::from(level).into()),
        (None, true) => EnvFilter::new("debug"),
        (None, false) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable.
pub fn init(log_level: Option<LogLevel>, verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(log_level, verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
