use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::DEFAULT_DEVICE_NAME;
use crate::service::orchestrator::{DeliveryConfig, DEFAULT_CHECK_INTERVAL};
use crate::status::log_monitor::default_log_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Matched case-insensitively as a substring of the advertised name.
    pub device_name: String,
    pub check_interval_seconds: u64,
    /// Log file or log directory of the chat client. Defaults to the client's standard location.
    pub log_path: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            check_interval: self.check_interval(),
            ..DeliveryConfig::default()
        }
    }

    pub fn resolved_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(default_log_path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            check_interval_seconds: DEFAULT_CHECK_INTERVAL.as_secs(),
            log_path: None,
            verbose: false,
        }
    }
}
