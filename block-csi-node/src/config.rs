//! Driver configuration file.
//!
//! The file is shared with the controller side: it names the plugin and
//! tells the node which publish-context keys carry the LUN, the
//! connectivity type and the array target IQN. The `node` section is
//! optional and exists so host paths and poll timing can be overridden.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DEFAULT_DEVICE_POLL_ATTEMPTS, PollPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Missing attribute [{0}] in driver config yaml file")]
    EmptyAttribute(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub identity: IdentityConfig,
    pub controller: PublishContextKeys,
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub name: String,
    pub version: String,
}

/// Publish-context keys written by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishContextKeys {
    pub publish_context_lun_parameter: String,
    pub publish_context_connectivity_parameter: String,
    pub publish_context_array_iqn: String,
}

/// Host paths and device discovery timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub initiator_name_file: PathBuf,
    pub iscsi_host_dir: PathBuf,
    pub scsi_host_dir: PathBuf,
    pub by_path_dir: PathBuf,
    pub sys_block_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub device_poll_attempts: u32,
    pub device_poll_interval_ms: u64,
    pub stage_timeout_secs: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            initiator_name_file: PathBuf::from("/etc/iscsi/initiatorname.iscsi"),
            iscsi_host_dir: PathBuf::from("/sys/class/iscsi_host"),
            scsi_host_dir: PathBuf::from("/sys/class/scsi_host"),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            sys_block_dir: PathBuf::from("/sys/block"),
            dev_dir: PathBuf::from("/dev"),
            device_poll_attempts: DEFAULT_DEVICE_POLL_ATTEMPTS,
            device_poll_interval_ms: 1000,
            stage_timeout_secs: None,
        }
    }
}

impl NodeConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.device_poll_attempts,
            Duration::from_millis(self.device_poll_interval_ms),
        )
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

impl DriverConfig {
    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("identity.name", &self.identity.name),
            ("identity.version", &self.identity.version),
            (
                "controller.publish_context_lun_parameter",
                &self.controller.publish_context_lun_parameter,
            ),
            (
                "controller.publish_context_connectivity_parameter",
                &self.controller.publish_context_connectivity_parameter,
            ),
            (
                "controller.publish_context_array_iqn",
                &self.controller.publish_context_array_iqn,
            ),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyAttribute(name));
            }
        }
        if self.node.device_poll_attempts == 0 {
            return Err(ConfigError::EmptyAttribute("node.device_poll_attempts"));
        }
        Ok(())
    }

    /// `{"driver_name": .., "driver_version": ..}` as printed by `--version`.
    pub fn version_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::json!({
            "driver_name": self.identity.name,
            "driver_version": self.identity.version,
        }))
    }
}
