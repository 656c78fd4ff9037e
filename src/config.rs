use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counter::{DEFAULT_MAX_TRACKED_FLOWS, DEFAULT_THRESHOLD};
use crate::error::ConfigError;
use crate::filter::{DEFAULT_IGNORE_RANGES, DEFAULT_MAX_DESTINATION_PORT};
use crate::uplink::{Backoff, FailurePolicy};

pub const CONFIG_FILE_NAME: &str = "network-agent.yaml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub capture: CaptureConfig,
    pub uplink: UplinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub threshold: u64,
    pub max_destination_port: u16,
    pub ignore_ranges: Vec<String>,
    pub max_tracked_flows: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface names to capture on. `None` captures on every interface.
    pub interfaces: Option<Vec<String>>,
    pub snaplen: usize,
    pub promiscuous: bool,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UplinkConfig {
    pub event_queue_capacity: usize,
    pub heartbeat_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub registration_timeout_secs: u64,
    pub failure_policy: FailurePolicyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    FailFast,
    Reconnect,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FailurePolicyConfig {
    pub mode: FailureMode,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: String,
    pub log_level: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            threshold: DEFAULT_THRESHOLD,
            max_destination_port: DEFAULT_MAX_DESTINATION_PORT,
            ignore_ranges: DEFAULT_IGNORE_RANGES.iter().map(|r| r.to_string()).collect(),
            max_tracked_flows: DEFAULT_MAX_TRACKED_FLOWS,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interfaces: None,
            snaplen: 1600,
            promiscuous: true,
            read_timeout_ms: 1000,
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        UplinkConfig {
            event_queue_capacity: 4096,
            heartbeat_queue_capacity: 64,
            heartbeat_interval_secs: 2,
            registration_timeout_secs: 10,
            failure_policy: FailurePolicyConfig::default(),
        }
    }
}

impl Default for FailurePolicyConfig {
    fn default() -> Self {
        FailurePolicyConfig {
            mode: FailureMode::FailFast,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: "network-agent.txt".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detection.threshold == 0 {
            return Err(ConfigError::Invalid("detection.threshold must be at least 1".into()));
        }
        if self.detection.max_tracked_flows == 0 {
            return Err(ConfigError::Invalid("detection.max_tracked_flows must be at least 1".into()));
        }
        if self.uplink.event_queue_capacity == 0 || self.uplink.heartbeat_queue_capacity == 0 {
            return Err(ConfigError::Invalid("uplink queue capacities must be at least 1".into()));
        }
        if self.uplink.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("uplink.heartbeat_interval_secs must be at least 1".into()));
        }
        if self.capture.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("capture.read_timeout_ms must be at least 1".into()));
        }
        if self.logging.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown logging.log_level '{}'",
                self.logging.log_level
            )));
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl UplinkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }
}

impl FailurePolicyConfig {
    pub fn to_policy(&self) -> FailurePolicy {
        match self.mode {
            FailureMode::FailFast => FailurePolicy::FailFast,
            FailureMode::Reconnect => FailurePolicy::Reconnect(Backoff {
                initial: Duration::from_millis(self.initial_backoff_ms.max(1)),
                max: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms).max(1)),
                max_attempts: self.max_attempts.max(1),
            }),
        }
    }
}

/// Config file to use when none is given on the command line: next to the
/// executable first, then in the working directory.
pub fn locate() -> Option<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()));

    exe_dir
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(CONFIG_FILE_NAME)))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_behavior() {
        let config = Config::default();
        assert_eq!(config.detection.threshold, 5);
        assert_eq!(config.detection.max_destination_port, 30000);
        assert_eq!(config.detection.ignore_ranges, vec!["224.0.0.0/3".to_string()]);
        assert_eq!(config.capture.snaplen, 1600);
        assert_eq!(config.uplink.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.uplink.failure_policy.to_policy(), FailurePolicy::FailFast);
        assert_eq!(config.logging.log_file, "network-agent.txt");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "detection:\n  threshold: 3\ncapture:\n  interfaces: [eth0, eth1]\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.detection.threshold, 3);
        assert_eq!(config.detection.max_destination_port, 30000);
        assert_eq!(
            config.capture.interfaces,
            Some(vec!["eth0".to_string(), "eth1".to_string()])
        );
        assert!(config.capture.promiscuous);
        assert_eq!(config.uplink.event_queue_capacity, 4096);
    }

    #[test]
    fn test_reconnect_policy_from_yaml() {
        let yaml = "uplink:\n  failure_policy:\n    mode: reconnect\n    initial_backoff_ms: 100\n    max_backoff_ms: 50\n    max_attempts: 3\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            config.uplink.failure_policy.to_policy(),
            FailurePolicy::Reconnect(Backoff {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(100),
                max_attempts: 3,
            })
        );
    }

    #[test]
    fn test_unknown_failure_mode_is_rejected() {
        let yaml = "uplink:\n  failure_policy:\n    mode: sometimes\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::default();
        config.detection.threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.uplink.event_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.log_level = "chatty".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "detection:\n  ignore_ranges: [\"224.0.0.0/3\", \"10.0.0.0/8\"]\nlogging:\n  log_level: debug").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.detection.ignore_ranges.len(), 2);
        assert_eq!(config.logging.log_level, "debug");
    }

    #[test]
    fn test_load_reports_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "detection:\n  threshold: 0").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))));

        let missing = Path::new("/nonexistent/network-agent.yaml");
        assert!(matches!(Config::load(missing), Err(ConfigError::Io(_))));
    }
}
