/// Controller configuration
///
/// Timeouts, retry policy and debug-monitor discovery settings. Loadable
/// from JSON; every field has a default.

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub connect_retry_budget: u32,
    pub connect_retry_interval_ms: u64,
    pub packet_timeout_ms: u64,
    pub launch_packet_timeout_ms: u64,
    pub interrupt_timeout_ms: u64,
    pub halt_verify_timeout_ms: u64,
    pub max_memory_chunk: usize,
    pub stub_exit_grace_ms: u64,
    pub stub_path_env: String,
    pub stub_log_file_env: String,
    pub stub_log_flags_env: String,
    pub stub_basename: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_retry_budget: 50,
            connect_retry_interval_ms: 100,
            packet_timeout_ms: 1000,
            launch_packet_timeout_ms: 10_000,
            interrupt_timeout_ms: 2000,
            halt_verify_timeout_ms: 5000,
            max_memory_chunk: 512,
            stub_exit_grace_ms: 500,
            stub_path_env: "RSP_DEBUGSERVER_PATH".into(),
            stub_log_file_env: "RSP_DEBUGSERVER_LOG_FILE".into(),
            stub_log_flags_env: "RSP_DEBUGSERVER_LOG_FLAGS".into(),
            stub_basename: "debugserver".into(),
        }
    }
}

impl ControllerConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn launch_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_packet_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn halt_verify_timeout(&self) -> Duration {
        Duration::from_millis(self.halt_verify_timeout_ms)
    }

    pub fn stub_exit_grace(&self) -> Duration {
        Duration::from_millis(self.stub_exit_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ControllerConfig::from_json_str(r#"{"connect_retry_budget": 3, "max_memory_chunk": 64}"#).unwrap();
        assert_eq!(config.connect_retry_budget, 3);
        assert_eq!(config.max_memory_chunk, 64);
        assert_eq!(config.connect_retry_interval(), Duration::from_millis(100));
        assert_eq!(config.stub_basename, "debugserver");
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(ControllerConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }
}
