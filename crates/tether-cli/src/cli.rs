use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tether_client::ClientConfig;
use tracing_subscriber::filter::LevelFilter;

/// Log level options for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    Off,
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace-level messages (every frame)
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "tether - talk to an editor daemon over its WebSocket bridge")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Page URL the daemon socket is derived from (overrides config file)
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Config file path (defaults to ~/.config/tether/config.toml)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Set log level (off, error, warn, info, debug, trace)
    /// If not specified, RUST_LOG is used, else warnings only
    #[arg(short = 'l', long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Enable verbose logging (shortcut for --log-level=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Request timeout in seconds (0 = wait forever)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Fetch /session before opening the socket
    #[arg(long, global = true)]
    pub session: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Send one request and print the daemon's ack
    Send {
        /// Operation name
        op: String,

        /// Request payload as JSON (defaults to null)
        data: Option<String>,
    },

    /// Print edits pushed for buffers until interrupted
    Watch {
        /// Buffer ids; plain decimal ids without leading zeros are sent as numbers
        #[arg(required = true)]
        buffers: Vec<String>,
    },
}

impl Cli {
    /// Apply command line flags on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if self.session {
            config.handshake.establish_session = true;
        }
    }
}
