//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Allowed client origins for CORS, comma-separated; `*` allows any
    pub client_origin: String,
    pub match_settings: MatchSettings,
}

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Per-match rules
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchSettings {
    /// Players needed before the countdown starts
    pub min_players: usize,
    pub max_players: usize,
    /// Score that ends the match
    pub win_score: u32,
    pub countdown: Duration,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players: 8,
            win_score: 3,
            countdown: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let defaults = MatchSettings::default();
        let min_players = parse_or(&lookup, "MIN_PLAYERS", defaults.min_players)?;
        let max_players = parse_or(&lookup, "MAX_PLAYERS", defaults.max_players)?;
        if min_players == 0 || min_players > max_players {
            return Err(ConfigError::Invalid("MIN_PLAYERS"));
        }
        let win_score = parse_or(&lookup, "WIN_SCORE", defaults.win_score)?;
        if win_score == 0 {
            return Err(ConfigError::Invalid("WIN_SCORE"));
        }
        let countdown_secs = parse_or(&lookup, "COUNTDOWN_SECS", defaults.countdown.as_secs())?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::default())?,
            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),

            match_settings: MatchSettings {
                min_players,
                max_players,
                win_score,
                countdown: Duration::from_secs(countdown_secs),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
