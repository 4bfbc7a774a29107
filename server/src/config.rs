use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Chat server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "chat-server", version, about = "Real-time chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CHAT_PORT", default_value = "3000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CHAT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./chat.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "CHAT_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "CHAT_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Live connection tuning (loaded from [realtime] section in TOML).
    /// Not serialized, so the CLI layer never masks the file or env values.
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub realtime: RealtimeConfig,
}

/// Per-connection limits and keep-alive timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Frames queued per connection before new ones are dropped (default: 256)
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
        }
    }
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_address: "0.0.0.0".to_string(),
            config: "./chat.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CHAT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        Self::figment(cli).extract()
    }

    fn figment(cli: Config) -> Figment {
        let config_path = cli.config.clone();
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CHAT_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chat Server Configuration
# Place this file at ./chat.toml or specify with --config <path>
# All settings can be overridden via environment variables (CHAT_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3000)
# port = 3000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# ---- Live connections ----
# [realtime]
# outbound_buffer = 256      # Frames queued per connection before dropping
# ping_interval_secs = 30    # Server ping cadence
# pong_timeout_secs = 10     # Close the connection if no pong arrives in time
# (env override example: CHAT_REALTIME__PING_INTERVAL_SECS=15)
"#
    .to_string()
}
