//! Tapestry configuration
//!
//! TOML-based configuration for the tunable constants of establishment and
//! listening. Configuration is optional: `Default` yields the documented
//! constants, a `tapestry.toml` in the working directory is honored when
//! present, and `TAPESTRY_*` environment variables override both.
//!
//! # Example tapestry.toml
//!
//! ```toml
//! [racing]
//! stagger_ms = 250
//! conn_timeout_secs = 30
//!
//! [listener]
//! accept_backlog = 100
//!
//! [rendezvous]
//! listener_grace_ms = 50
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export TAPESTRY_RACING_STAGGER_MS=100
//! export TAPESTRY_RACING_CONN_TIMEOUT_SECS=10
//! export TAPESTRY_LISTENER_CONNECTION_LIMIT=64
//! export TAPESTRY_RENDEZVOUS_LISTENER_GRACE_MS=50
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Candidate-racing tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RacingConfig {
    /// Delay between launching consecutive candidate attempts
    pub stagger_ms: u64,
    /// Bound on the whole establishment when properties carry no timeout
    pub conn_timeout_secs: u64,
}

impl Default for RacingConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 250,
            conn_timeout_secs: 30,
        }
    }
}

impl RacingConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs)
    }
}

/// Listener tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Buffer size of the accepted-connection stream
    pub accept_backlog: usize,
    /// Accepted-connection limit; over-limit channels are closed immediately
    pub connection_limit: Option<usize>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 100,
            connection_limit: None,
        }
    }
}

/// Rendezvous tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Listener readiness grace before outbound attempts start
    pub listener_grace_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self { listener_grace_ms: 50 }
    }
}

impl RendezvousConfig {
    pub fn listener_grace(&self) -> Duration {
        Duration::from_millis(self.listener_grace_ms)
    }
}

/// Top-level Tapestry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapestryConfig {
    pub racing: RacingConfig,
    pub listener: ListenerConfig,
    pub rendezvous: RendezvousConfig,
}

impl TapestryConfig {
    /// Load configuration: `tapestry.toml` when present, defaults otherwise,
    /// `TAPESTRY_*` environment variables on top
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if Path::new("tapestry.toml").exists() {
            Self::load_from_file("tapestry.toml")?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from an explicit TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `TAPESTRY_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_u64("TAPESTRY_RACING_STAGGER_MS")? {
            self.racing.stagger_ms = v;
        }
        if let Some(v) = env_u64("TAPESTRY_RACING_CONN_TIMEOUT_SECS")? {
            self.racing.conn_timeout_secs = v;
        }
        if let Some(v) = env_u64("TAPESTRY_LISTENER_CONNECTION_LIMIT")? {
            self.listener.connection_limit = Some(v as usize);
        }
        if let Some(v) = env_u64("TAPESTRY_RENDEZVOUS_LISTENER_GRACE_MS")? {
            self.rendezvous.listener_grace_ms = v;
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", name, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TapestryConfig::default();
        assert_eq!(config.racing.stagger(), Duration::from_millis(250));
        assert_eq!(config.racing.conn_timeout(), Duration::from_secs(30));
        assert_eq!(config.listener.accept_backlog, 100);
        assert_eq!(config.listener.connection_limit, None);
        assert_eq!(config.rendezvous.listener_grace(), Duration::from_millis(50));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: TapestryConfig = toml::from_str(
            r#"
            [racing]
            stagger_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.racing.stagger_ms, 100);
        // Unspecified fields fall back to defaults
        assert_eq!(config.racing.conn_timeout_secs, 30);
        assert_eq!(config.listener.accept_backlog, 100);
    }

    #[test]
    fn test_round_trip() {
        let config = TapestryConfig {
            racing: RacingConfig {
                stagger_ms: 50,
                conn_timeout_secs: 5,
            },
            listener: ListenerConfig {
                accept_backlog: 16,
                connection_limit: Some(8),
            },
            rendezvous: RendezvousConfig { listener_grace_ms: 10 },
        };
        let rendered = toml::to_string(&config).unwrap();
        let back: TapestryConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_missing_file() {
        let result = TapestryConfig::load_from_file("/nonexistent/tapestry.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
