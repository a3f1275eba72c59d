//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which half of the backend this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Lobby,
    Match,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerRole::Lobby => "lobby",
            ServerRole::Match => "match",
        }
    }
}

impl FromStr for ServerRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lobby" => Ok(ServerRole::Lobby),
            "match" => Ok(ServerRole::Match),
            _ => Err(ConfigError::Invalid("SERVER_ROLE")),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub role: ServerRole,
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// `LOG_FORMAT=json` switches to JSON lines
    pub log_json: bool,
    /// Root of the Players/, Maps/ and Replays/ directories
    pub data_root: PathBuf,
    /// Identity this lobby presents to match servers
    pub server_id: String,

    /// Lobby -> match RPC endpoint
    pub match_server_url: String,
    /// Base of the match URL handed to clients on launch
    pub match_public_url: String,
    /// Shared HMAC secret for match RPC signatures
    pub match_rpc_secret: String,
    /// Allowed client origin for CORS
    pub client_origin: String,

    pub tick: Duration,
    pub max_local_players: usize,
    pub ping_samples: usize,
    pub ping_interval: Duration,
    pub bot_control_timeout: Duration,
    pub liveness_interval: Duration,
    pub liveness_max_failures: u32,
    pub rpc_timeout: Duration,
    pub transport_poll: Duration,
    /// Inbound frames per second per connection
    pub client_rate_limit: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any name -> value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port.trim()),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let role = match lookup("SERVER_ROLE") {
            Some(raw) => raw.parse()?,
            None => ServerRole::Lobby,
        };

        Ok(Self {
            role,
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            data_root: PathBuf::from(lookup("DATA_ROOT").unwrap_or_else(|| "data".to_string())),
            server_id: lookup("SERVER_ID").unwrap_or_else(|| "lobby-1".to_string()),

            match_server_url: lookup("MATCH_SERVER_URL")
                .unwrap_or_else(|| "http://localhost:8081/match/rpc".to_string()),
            match_public_url: lookup("MATCH_PUBLIC_URL")
                .unwrap_or_else(|| "ws://localhost:8081/match".to_string()),
            match_rpc_secret: lookup("MATCH_RPC_SECRET")
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::Missing("MATCH_RPC_SECRET"))?,
            client_origin: lookup("CLIENT_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),

            tick: Duration::from_millis(parse_or(&lookup, "TICK_MS", 100)?),
            max_local_players: parse_or(&lookup, "MAX_LOCAL_PLAYERS", 4)?,
            ping_samples: parse_or(&lookup, "PING_SAMPLES", 4)?,
            ping_interval: Duration::from_millis(parse_or(&lookup, "PING_INTERVAL_MS", 1000)?),
            bot_control_timeout: Duration::from_millis(parse_or(
                &lookup,
                "BOT_CONTROL_TIMEOUT_MS",
                5000,
            )?),
            liveness_interval: Duration::from_secs(parse_or(
                &lookup,
                "LIVENESS_INTERVAL_SECS",
                30,
            )?),
            liveness_max_failures: parse_or(&lookup, "LIVENESS_MAX_FAILURES", 3)?,
            rpc_timeout: Duration::from_millis(parse_or(&lookup, "RPC_TIMEOUT_MS", 5000)?),
            transport_poll: Duration::from_millis(parse_or(&lookup, "TRANSPORT_POLL_MS", 10)?),
            client_rate_limit: parse_or(&lookup, "CLIENT_RATE_LIMIT", 60)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
