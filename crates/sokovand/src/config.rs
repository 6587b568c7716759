//! Daemon configuration.
//!
//! TOML file selecting per-resource-group scheduling strategies plus
//! timer, retry, and sweep tuning. Every section has defaults, so an
//! absent file runs a single `default` resource group with FIFO
//! sequencing and concentrated selection.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub timers: TimersConfig,
    pub retry: RetryConfig,
    pub sweep: SweepConfig,
    pub resource_groups: BTreeMap<String, GroupConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            timers: TimersConfig::default(),
            retry: RetryConfig::default(),
            sweep: SweepConfig::default(),
            resource_groups: BTreeMap::from([("default".to_string(), GroupConfig::default())]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimersConfig {
    /// Marker-gated wakeup cadence, seconds.
    pub check_interval_secs: u64,
    /// Unconditional wakeup cadence, seconds.
    pub force_interval_secs: u64,
    /// Stale phase-lock takeover threshold, seconds.
    pub lock_lifetime_secs: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 2,
            force_interval_secs: 30,
            lock_lifetime_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// How long a session may sit in one phase before it is retried.
    pub staleness_secs: u64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 60,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    /// Pending sessions older than this are cancelled.
    pub pending_timeout_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            pending_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroupConfig {
    /// `fifo`, `lifo`, `drf`, or `fair_share`.
    pub sequencer: String,
    /// `concentrated`, `dispersed`, `round_robin`, or `legacy`.
    pub selector: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            sequencer: "fifo".to_string(),
            selector: "concentrated".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&raw)?;
        anyhow::ensure!(
            !config.resource_groups.is_empty(),
            "config must define at least one resource group"
        );
        Ok(config)
    }
}
