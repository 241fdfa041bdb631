use clap::Parser;
use std::path::PathBuf;

/// Default port for the HTTP/WebSocket edge.
pub const DEFAULT_PORT: u16 = 9010;

#[derive(Parser, Debug, Clone)]
#[clap(about = "FinStream real-time ingestion engine", version)]
pub struct Config {
    #[clap(long, env = "FINSTREAM_CONFIG", help = "Path to the engine configuration file (JSON).")]
    pub config: Option<PathBuf>,

    #[clap(long, env = "FINSTREAM_PORT", default_value_t = DEFAULT_PORT, help = "Port to listen on for client connections.")]
    pub port: u16,

    #[clap(long, env = "FINSTREAM_LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    pub log_dir: PathBuf,

    #[clap(long, env = "FINSTREAM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error). Overrides the engine config.")]
    pub log_level: Option<String>,
}

impl Config {
    /// The level used at startup: the command line wins over the engine config.
    pub fn effective_log_level<'a>(&'a self, configured: &'a str) -> &'a str {
        self.log_level.as_deref().unwrap_or(configured)
    }
}
