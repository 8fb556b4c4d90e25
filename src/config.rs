//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Highest world id the client knows about
const MAX_WORLD_ID: u8 = 31;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name (world name shown to players)
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// World ID (0-31)
    #[serde(default)]
    pub world_id: u8,

    /// Channel ID within the world
    #[serde(default)]
    pub channel_id: u8,

    /// Base game port (TCP); the channel listens on base + channel id
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Path to data files (templates, characters)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Field update tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Maximum simultaneous connections from one IP
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Seconds without inbound traffic before a connection is dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Development mode flag
    #[serde(default)]
    pub dev_mode: bool,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

// Default value functions
fn default_server_name() -> String {
    "Scania".to_string()
}

fn default_game_port() -> u16 {
    8585
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_tick_rate() -> u64 {
    1000
}

fn default_max_connections_per_ip() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            world_id: 0,
            channel_id: 0,
            game_port: default_game_port(),
            data_path: default_data_path(),
            tick_rate_ms: default_tick_rate(),
            max_connections_per_ip: default_max_connections_per_ip(),
            idle_timeout_secs: default_idle_timeout(),
            dev_mode: false,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("FIELD_SERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FIELD_SERVER_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("FIELD_SERVER_WORLD_ID") {
            if let Ok(id) = val.parse() {
                self.world_id = id;
            }
        }
        if let Ok(val) = env::var("FIELD_SERVER_CHANNEL_ID") {
            if let Ok(id) = val.parse() {
                self.channel_id = id;
            }
        }
        if let Ok(val) = env::var("FIELD_SERVER_GAME_PORT") {
            if let Ok(port) = val.parse() {
                self.game_port = port;
            }
        }
        if let Ok(val) = env::var("FIELD_SERVER_DATA_PATH") {
            self.data_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("FIELD_SERVER_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
        if let Ok(val) = env::var("FIELD_SERVER_MAX_CONNECTIONS_PER_IP") {
            if let Ok(max) = val.parse() {
                self.max_connections_per_ip = max;
            }
        }
        if let Ok(val) = env::var("FIELD_SERVER_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.idle_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("FIELD_SERVER_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("FIELD_SERVER_DEBUG") {
            self.debug = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.world_id > MAX_WORLD_ID {
            anyhow::bail!("World ID must be between 0 and {}", MAX_WORLD_ID);
        }

        if self.game_port == 0 {
            anyhow::bail!("Game port must not be 0");
        }

        if self.game_port.checked_add(self.channel_id as u16).is_none() {
            anyhow::bail!("Game port plus channel ID exceeds the port range");
        }

        // Tick rate must be reasonable
        if self.tick_rate_ms < 100 || self.tick_rate_ms > 10000 {
            anyhow::bail!("Tick rate must be between 100ms and 10000ms");
        }

        if self.max_connections_per_ip == 0 {
            anyhow::bail!("Max connections per IP must be at least 1");
        }

        if self.idle_timeout_secs == 0 {
            anyhow::bail!("Idle timeout must be at least 1 second");
        }

        Ok(())
    }

    /// Get the actual game port (base port + channel ID)
    pub fn actual_game_port(&self) -> u16 {
        self.game_port.saturating_add(self.channel_id as u16)
    }

    /// How long a connection may stay silent
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Path of the template data file
    pub fn templates_path(&self) -> PathBuf {
        self.data_path.join("templates.json")
    }

    /// Path of the character data file
    pub fn characters_path(&self) -> PathBuf {
        self.data_path.join("characters.json")
    }
}
