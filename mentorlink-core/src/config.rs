//! Call configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty or
//! missing file yields a working configuration.

use crate::types::{IceServer, MediaConstraints};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path that was read
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// TOML could not be parsed
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallConfig {
    /// Configured STUN/TURN servers, used when the ICE endpoint is unavailable
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// Capture constraints for camera and microphone
    #[serde(default)]
    pub media: MediaConstraints,
    /// Connection quality sampling
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Teardown, presence and reconnection
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Base URL of the call REST endpoints
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Connection monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sample statistics while connected
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sampling interval in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub interval_ms: u64,
    /// Loss rate above which `Degraded` is emitted (0.0..=1.0)
    #[serde(default = "default_loss_threshold")]
    pub loss_threshold: f64,
}

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a peer may be absent from the relay before its leave is synthesized
    #[serde(default = "default_presence_timeout_ms")]
    pub presence_timeout_ms: u64,
    /// How long `join` waits for the relay to confirm membership
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// Upper bound on the network part of teardown
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    /// End the session once every peer transport has failed
    #[serde(default)]
    pub end_on_transport_failure: bool,
    /// Signaling reconnection
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Signaling reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts before the session ends with `SignalingLost`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay step in milliseconds; attempt `n` waits `n` steps
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_sample_interval_ms() -> u64 {
    5_000
}
fn default_loss_threshold() -> f64 {
    0.05
}
fn default_presence_timeout_ms() -> u64 {
    10_000
}
fn default_join_timeout_ms() -> u64 {
    10_000
}
fn default_teardown_timeout_ms() -> u64 {
    2_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    1_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_sample_interval_ms(),
            loss_threshold: default_loss_threshold(),
        }
    }
}

impl MonitorConfig {
    /// Sampling interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            presence_timeout_ms: default_presence_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            end_on_transport_failure: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    /// Presence timeout
    #[must_use]
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Join timeout
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Teardown timeout
    #[must_use]
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms.saturating_mul(u64::from(attempt.max(1)));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl CallConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is invalid
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate the configuration, returning every issue found
    ///
    /// Issues are prefixed with "ERROR:" (unusable) or "WARN:" (likely wrong).
    ///
    /// # Errors
    ///
    /// Returns the list of issues if there are any
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if !(0.0..=1.0).contains(&self.monitor.loss_threshold) {
            issues.push(format!(
                "ERROR: monitor.loss_threshold {} must be between 0.0 and 1.0",
                self.monitor.loss_threshold
            ));
        }
        if self.monitor.enabled && self.monitor.interval_ms == 0 {
            issues.push("ERROR: monitor.interval_ms must be greater than 0".to_string());
        }
        if self.supervisor.join_timeout_ms == 0 {
            issues.push("ERROR: supervisor.join_timeout_ms must be greater than 0".to_string());
        }
        if self.supervisor.presence_timeout_ms < 1_000 {
            issues.push(format!(
                "WARN: supervisor.presence_timeout_ms {} is short; brief network blips will drop peers",
                self.supervisor.presence_timeout_ms
            ));
        }
        let reconnect = &self.supervisor.reconnect;
        if reconnect.max_attempts == 0 {
            issues.push(
                "WARN: supervisor.reconnect.max_attempts is 0; any signaling drop ends the call"
                    .to_string(),
            );
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            issues.push(format!(
                "WARN: supervisor.reconnect.max_delay_ms {} is below base_delay_ms {}",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            ));
        }
        if !self.media.has_audio() && !self.media.has_video() {
            issues.push("ERROR: media must request audio, video or both".to_string());
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                issues.push("ERROR: ice_servers entry has no urls".to_string());
            }
            for url in &server.urls {
                let turn = url.starts_with("turn:") || url.starts_with("turns:");
                if !turn && !url.starts_with("stun:") {
                    issues.push(format!("ERROR: ice server url '{url}' must start with stun:, turn: or turns:"));
                }
                if turn && (server.username.is_none() || server.credential.is_none()) {
                    issues.push(format!("WARN: TURN server '{url}' has no username/credential"));
                }
            }
        }
        if let Some(url) = &self.api_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                issues.push(format!("ERROR: api_base_url '{url}' must be an http(s) URL"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.monitor.interval(), Duration::from_secs(5));
        assert!((config.monitor.loss_threshold - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.supervisor.presence_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.join_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.reconnect.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(4), Duration::from_millis(400));
        assert_eq!(policy.backoff(30), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CallConfig::from_toml_str(
            r#"
            [monitor]
            loss_threshold = 0.1

            [supervisor.reconnect]
            max_attempts = 2

            [[ice_servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "u"
            credential = "c"
            "#,
        )
        .unwrap();
        assert!((config.monitor.loss_threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.monitor.interval_ms, 5_000);
        assert_eq!(config.supervisor.reconnect.max_attempts, 2);
        assert_eq!(config.supervisor.reconnect.base_delay_ms, 100);
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_issue() {
        let mut config = CallConfig::default();
        config.monitor.loss_threshold = 1.5;
        config.ice_servers = vec![IceServer {
            urls: vec!["http://nope".to_string(), "turn:t.example.com".to_string()],
            username: None,
            credential: None,
        }];
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 3);
        assert!(issues[0].starts_with("ERROR: monitor.loss_threshold"));
        assert!(issues.iter().any(|i| i.starts_with("WARN: TURN server")));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CallConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.supervisor.join_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_base_url = \"https://api.example.com\"").unwrap();
        let config = CallConfig::load(file.path()).unwrap();
        assert_eq!(config.api_base_url.as_deref(), Some("https://api.example.com"));
    }
}
