use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::DEFAULT_REQUEST_TIMEOUT;

/// Upper bound for every configured delay and timeout.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing policy of a session. Durations are written as seconds in files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "seconds")]
    pub request_timeout: Duration,
    /// Health check interval when nothing else happens.
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
    #[serde(with = "seconds")]
    pub sim_poll_interval: Duration,
    /// Delay before redialing after the modem reports a call list change.
    #[serde(with = "seconds")]
    pub settle_delay: Duration,
    /// How long to wait for the device node to come back after a reset.
    #[serde(with = "seconds")]
    pub reset_wait: Duration,
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,
    /// Retry delays in seconds, indexed by consecutive failures.
    pub backoff_table: Vec<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: Duration::from_secs(15),
            sim_poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_millis(1_000),
            reset_wait: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(30),
            backoff_table: vec![5, 10, 20, 40, 60],
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Reject an empty backoff table and delays longer than [`MAX_DELAY`].
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.backoff_table.is_empty(),
            "backoff_table must not be empty"
        );
        if let Some(secs) = self
            .backoff_table
            .iter()
            .find(|secs| **secs > MAX_DELAY.as_secs())
        {
            anyhow::bail!("backoff_table entry {}s exceeds {:?}", secs, MAX_DELAY);
        }
        let durations = [
            ("request_timeout", self.request_timeout),
            ("idle_timeout", self.idle_timeout),
            ("sim_poll_interval", self.sim_poll_interval),
            ("settle_delay", self.settle_delay),
            ("reset_wait", self.reset_wait),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, value) in durations {
            anyhow::ensure!(value <= MAX_DELAY, "{} {:?} exceeds {:?}", name, value, MAX_DELAY);
        }
        Ok(())
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() -> Result<()> {
        let config: SessionConfig =
            serde_json::from_str(r#"{"idle_timeout": 5, "settle_delay": 0.5}"#)?;
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.backoff_table, vec![5, 10, 20, 40, 60]);
        Ok(())
    }

    #[test]
    fn test_validate_bounds() -> Result<()> {
        assert!(SessionConfig::default().validate().is_ok());

        let config: SessionConfig =
            serde_json::from_str(r#"{"backoff_table": [5, 18446744073709551615]}"#)?;
        assert!(config.validate().is_err());

        let config: SessionConfig = serde_json::from_str(r#"{"backoff_table": []}"#)?;
        assert!(config.validate().is_err());

        let config: SessionConfig = serde_json::from_str(r#"{"settle_delay": 1e12}"#)?;
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_load_rejects_huge_backoff() -> Result<()> {
        let path = std::env::temp_dir().join(format!("qcm-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"backoff_table": [10, 99999999999]}"#)?;
        let loaded = SessionConfig::load(&path);
        std::fs::remove_file(&path)?;
        assert!(loaded.is_err());
        Ok(())
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let parsed: Result<SessionConfig, _> = serde_json::from_str(r#"{"reset_wait": -1}"#);
        assert!(parsed.is_err());
    }
}
