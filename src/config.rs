//! Configuration and logging setup.
//!
//! `clap::Parser` structs with `#[arg(long, env = ...)]` per field, plus
//! an `EnvFilter`-backed tracing setup with a plain/JSON formatting switch
//! chosen by a flag. No config-file loading or live log-level reload —
//! there's no remote-config channel to drive either from here.

use clap::Parser;

use crate::server::CorsMode;

/// Tempo RPC demo server.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "TEMPO_LISTEN_ADDR", default_value = "0.0.0.0:7777")]
    pub listen_addr: String,

    /// Maximum request body size accepted, in bytes.
    #[arg(long, env = "TEMPO_MAX_RECEIVE_SIZE", default_value_t = 4 * 1024 * 1024)]
    pub max_receive_size: usize,

    /// Maximum response body size produced, in bytes.
    #[arg(long, env = "TEMPO_MAX_SEND_SIZE", default_value_t = 4 * 1024 * 1024)]
    pub max_send_size: usize,

    /// CORS posture: "off", "*", or a comma-separated origin allow-list.
    #[arg(long, env = "TEMPO_CORS", default_value = "off")]
    pub cors: String,

    /// Serve the `/` discovery descriptor.
    #[arg(long, env = "TEMPO_DISCOVERY", default_value_t = true)]
    pub discovery: bool,

    /// Echo internal error text to callers instead of a generic message.
    #[arg(long, env = "TEMPO_TRANSMIT_INTERNAL_ERRORS", default_value_t = false)]
    pub transmit_internal_errors: bool,

    /// Requests claiming more than this many previous attempts are rejected.
    #[arg(long, env = "TEMPO_MAX_RETRY_ATTEMPTS", default_value_t = 5)]
    pub max_retry_attempts: u32,

    /// HTML-escape string values and drop `$`-prefixed object keys in
    /// outgoing JSON-codec payloads; the binary codec is never touched.
    #[arg(long, env = "TEMPO_SANITIZE_JSON", default_value_t = false)]
    pub sanitize_json: bool,

    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "tempo_rpc=debug".
    #[arg(long, env = "TEMPO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of the default human-readable format.
    #[arg(long, env = "TEMPO_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl ServerConfig {
    pub fn cors_mode(&self) -> CorsMode {
        match self.cors.as_str() {
            "off" | "" => CorsMode::Disabled,
            "*" => CorsMode::Wildcard,
            list => CorsMode::AllowList(list.split(',').map(|s| s.trim().to_string()).collect()),
        }
    }
}

/// Tempo RPC demo client.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ChannelConfig {
    /// Target base URL, e.g. http://127.0.0.1:7777.
    #[arg(long, env = "TEMPO_TARGET")]
    pub target: String,

    /// Maximum response body size accepted, in bytes.
    #[arg(long, env = "TEMPO_MAX_RECEIVE_SIZE", default_value_t = 4 * 1024 * 1024)]
    pub max_receive_size: usize,

    /// Per-call deadline, in milliseconds. Omit for no deadline.
    #[arg(long, env = "TEMPO_DEADLINE_MS")]
    pub deadline_ms: Option<u64>,

    /// Allow attaching a real credential over a plaintext (http://) target.
    #[arg(long, env = "TEMPO_UNSAFE_ALLOW_INSECURE", default_value_t = false)]
    pub unsafe_allow_insecure: bool,

    #[arg(long, env = "TEMPO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "TEMPO_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Initialize the global `tracing` subscriber from a level string and a
/// plain/JSON switch. No live-reload handle: the level is fixed at
/// startup.
pub fn init_tracing(log_level: &str, log_json: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
