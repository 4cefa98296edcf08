//! Configuration handling for the pairlink binary.
//!
//! Settings come from a YAML file, then environment variables, then the
//! command line (applied by the caller). Durations are written in humantime
//! form (`2s`, `150ms`, `2m`).
//!
//! ```yaml
//! relay:
//!   addr: 127.0.0.1:7070
//!   connect_timeout: 10s
//! session:
//!   handshake_grace: 2s
//!   prompt_timeout: 2m
//!   max_tokens: 1024
//! retry:
//!   initial_delay: 1s
//!   max_attempts: 5
//! ```
//!
//! User preferences (last pairing code and connection mode) are stored
//! separately in [`Preferences`] since the binary rewrites them.

use anyhow::{Context, Result};
use pairlink_session::{ClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Pairlink binary configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairlinkConfig {
    /// Rendezvous relay settings
    pub relay: RelaySettings,
    /// Session timing
    pub session: SessionSettings,
    /// Reconnect backoff
    pub retry: RetrySettings,
    /// Where the chat command keeps its preferences
    pub preferences_path: String,
}

/// Rendezvous relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Relay address (`host:port`)
    pub addr: String,
    /// TCP connect timeout
    #[serde(with = "humantime_str")]
    pub connect_timeout: Duration,
}

/// Session timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Wait for `version_ack` before assuming compatibility
    #[serde(with = "humantime_str")]
    pub handshake_grace: Duration,
    /// Limit for one prompt
    #[serde(with = "humantime_str")]
    pub prompt_timeout: Duration,
    /// Retry countdown update period
    #[serde(with = "humantime_str")]
    pub countdown_interval: Duration,
    /// Wait for the peer after a reconnect before trying again
    #[serde(with = "humantime_str")]
    pub peer_discovery_timeout: Duration,
    /// Generation limit forwarded with prompts
    pub max_tokens: Option<u32>,
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// First retry delay
    #[serde(with = "humantime_str")]
    pub initial_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Delay cap
    #[serde(with = "humantime_str")]
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7070".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            handshake_grace: defaults.handshake_grace,
            prompt_timeout: defaults.prompt_timeout,
            countdown_interval: defaults.countdown_interval,
            peer_discovery_timeout: defaults.peer_discovery_timeout,
            max_tokens: defaults.max_tokens,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            initial_delay: defaults.initial_delay,
            multiplier: defaults.backoff_multiplier,
            max_delay: defaults.max_delay,
            max_attempts: defaults.max_attempts,
        }
    }
}

impl Default for PairlinkConfig {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            session: SessionSettings::default(),
            retry: RetrySettings::default(),
            preferences_path: "pairlink-prefs.yaml".to_string(),
        }
    }
}

impl PairlinkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: relay={}, grace={:?}, prompt_timeout={:?}, max_attempts={}",
            config.relay.addr,
            config.session.handshake_grace,
            config.session.prompt_timeout,
            config.retry.max_attempts
        );
        Ok(config)
    }

    /// Apply `PAIRLINK_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("PAIRLINK_RELAY_ADDR") {
            info!("Relay address overridden by environment: {}", addr);
            self.relay.addr = addr;
        }

        if let Some(value) = lookup("PAIRLINK_HANDSHAKE_GRACE_MS") {
            match value.parse::<u64>() {
                Ok(ms) => {
                    self.session.handshake_grace = Duration::from_millis(ms);
                    info!("Handshake grace overridden by environment: {}ms", ms);
                }
                Err(_) => warn!("Ignoring invalid PAIRLINK_HANDSHAKE_GRACE_MS={}", value),
            }
        }

        if let Some(value) = lookup("PAIRLINK_PROMPT_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => {
                    self.session.prompt_timeout = Duration::from_secs(secs);
                    info!("Prompt timeout overridden by environment: {}s", secs);
                }
                Err(_) => warn!("Ignoring invalid PAIRLINK_PROMPT_TIMEOUT_SECS={}", value),
            }
        }

        if let Some(value) = lookup("PAIRLINK_MAX_RETRY_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(attempts) => {
                    self.retry.max_attempts = attempts;
                    info!("Max retry attempts overridden by environment: {}", attempts);
                }
                Err(_) => warn!("Ignoring invalid PAIRLINK_MAX_RETRY_ATTEMPTS={}", value),
            }
        }
    }

    /// Library configuration for a [`pairlink_session::RemoteClient`]
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            handshake_grace: self.session.handshake_grace,
            prompt_timeout: self.session.prompt_timeout,
            countdown_interval: self.session.countdown_interval,
            peer_discovery_timeout: self.session.peer_discovery_timeout,
            retry: RetryPolicy {
                initial_delay: self.retry.initial_delay,
                backoff_multiplier: self.retry.multiplier,
                max_delay: self.retry.max_delay,
                max_attempts: self.retry.max_attempts,
            },
            max_tokens: self.session.max_tokens,
        }
    }
}

/// How the chat command reconnects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Connect once; reconnect only when asked
    #[default]
    Static,
    /// Reconnect automatically after peer loss
    Dynamic,
}

/// Persisted user choices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Pairing code of the last successful `connect`
    pub last_pairing_code: Option<String>,
    /// Reconnect behaviour
    pub mode: ConnectionMode,
}

impl Preferences {
    /// Load preferences; a missing file yields defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse preferences {:?}", path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read preferences {:?}", path)),
        }
    }

    /// Take the mode given on the command line, keeping the stored one otherwise
    pub fn apply_mode(&mut self, mode: Option<ConnectionMode>) -> ConnectionMode {
        if let Some(mode) = mode {
            if mode != self.mode {
                info!("Connection mode changed to {:?}", mode);
            }
            self.mode = mode;
        }
        self.mode
    }

    /// Write preferences, replacing the file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write preferences {:?}", path))
    }
}

mod humantime_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
