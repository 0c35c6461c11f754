//! hm.toml configuration parser.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides. Times are whole seconds; the analyzer treats one second as one
//! tick.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use anyhow::bail;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HmConfig {
    /// Base URL of the bulk desired-state API.
    pub desired_state_server_base_url: String,
    /// Page size requested from the bulk API.
    pub desired_state_batch_size: u32,
    /// TTL for stored desired-state entries. Entries are written with one
    /// second less than this.
    pub desired_state_ttl: u64,
    /// Seconds between desired-state fetch cycles.
    pub desired_state_polling_interval: u64,
    pub desired_freshness_key: String,
    pub desired_freshness_ttl: u64,

    pub auth_subject: String,
    /// Upper bound on the wait for the auth reply. `None` waits forever.
    pub auth_timeout: Option<u64>,
    pub heartbeat_subject: String,
    pub start_subject: String,
    pub stop_subject: String,

    /// Seconds a host's most recent heartbeat is trusted.
    pub heartbeat_ttl: u64,
    /// Seconds between analyzer ticks.
    pub analyzer_interval: u64,
    /// Minimum dwell between restart attempts of a crashing instance.
    pub grace_period: u64,
    /// Attempts sent at grace-period cadence before the delay escalates.
    pub backoff_threshold: u32,
    /// Cap on the escalated delay. Crash counts expire after twice this.
    pub max_backoff_delay: u64,

    pub store_path: PathBuf,
    /// Served on `auth_subject` when running standalone.
    pub credentials: Option<Credentials>,
}

/// Basic-auth credentials for the bulk API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Default for HmConfig {
    fn default() -> Self {
        Self {
            desired_state_server_base_url: "http://127.0.0.1:8181".to_string(),
            desired_state_batch_size: 500,
            desired_state_ttl: 600,
            desired_state_polling_interval: 60,
            desired_freshness_key: "/desired-fresh".to_string(),
            desired_freshness_ttl: 120,
            auth_subject: "cloudcontroller.bulk.credentials.default".to_string(),
            auth_timeout: None,
            heartbeat_subject: "dea.heartbeat".to_string(),
            start_subject: "health.start".to_string(),
            stop_subject: "health.stop".to_string(),
            heartbeat_ttl: 30,
            analyzer_interval: 10,
            grace_period: 30,
            backoff_threshold: 3,
            max_backoff_delay: 960,
            store_path: PathBuf::from("/var/lib/hm/hm.redb"),
            credentials: None,
        }
    }
}

impl HmConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HmConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the fetcher or analyzer cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.desired_state_batch_size == 0 {
            bail!("desired_state_batch_size must be at least 1");
        }
        if self.desired_state_ttl < 2 {
            bail!("desired_state_ttl must be at least 2 seconds");
        }
        if self.grace_period == 0 {
            bail!("grace_period must be at least 1 second");
        }
        if self.backoff_threshold == 0 {
            bail!("backoff_threshold must be at least 1");
        }
        if self.max_backoff_delay < self.grace_period {
            bail!(
                "max_backoff_delay ({}) must not be shorter than grace_period ({})",
                self.max_backoff_delay,
                self.grace_period
            );
        }
        Ok(())
    }

    /// TTL stored on each desired-state entry.
    pub fn stored_desired_state_ttl(&self) -> u64 {
        self.desired_state_ttl - 1
    }

    /// Lifetime of a crash count without a new restart attempt.
    pub fn crash_count_ttl(&self) -> u64 {
        self.max_backoff_delay * 2
    }
}
