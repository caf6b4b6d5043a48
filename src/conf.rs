//! The Serializable configuration data structures used for setup.
//!
//! Every knob has a default, so a supervisor started without a configuration
//! file behaves exactly like one started with an empty file.
use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Upper bound on one wait for control input.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause after the control channel reports a hang-up.
    #[serde(default = "default_hangup_pause_ms")]
    pub hangup_pause_ms: u64,

    /// Attempts at writing one command byte into a dependency's channel.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,

    #[serde(default = "default_fork_retry_ms")]
    pub fork_retry_ms: u64,
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hangup_pause(&self) -> Duration {
        Duration::from_millis(self.hangup_pause_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn fork_retry(&self) -> Duration {
        Duration::from_millis(self.fork_retry_ms)
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            hangup_pause_ms: default_hangup_pause_ms(),
            send_retries: default_send_retries(),
            send_interval_ms: default_send_interval_ms(),
            fork_retry_ms: default_fork_retry_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_cfg_ver")]
    pub version: u32,

    #[serde(default)]
    pub timing: Timing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_cfg_ver(),
            timing: Timing::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                let text = fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|source| Error::Config {
                    path: path.to_path_buf(),
                    source,
                })
            }
            _ => Err(Error::UnsupportedConfig(path.to_path_buf())),
        }
    }
}

fn default_cfg_ver() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_hangup_pause_ms() -> u64 {
    250
}

fn default_send_retries() -> u32 {
    3
}

fn default_send_interval_ms() -> u64 {
    1_000
}

fn default_fork_retry_ms() -> u64 {
    1_000
}
