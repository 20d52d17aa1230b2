//! Pool configuration.
//!
//! Loaded from a JSON file at [`default_config_path`] (overridable through
//! `QUOTAPOOL_CONFIG_PATH`); a missing or unparsable file falls back to the
//! defaults, which match the thresholds the pool has historically run with.

use std::{env, io::Error, path::PathBuf, time::Duration};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};

use quotapool_ledger::CheckInPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Inclusive bounds of the daily check-in issuance.
    pub checkin_min: i64,
    pub checkin_max: i64,
    /// Fixed UTC offset anchoring the check-in calendar day.
    pub checkin_utc_offset_hours: i8,
    /// Lifetime of issued grants, in days.
    pub grant_ttl_days: i64,
    /// Lifetime of cached resolutions, in seconds.
    pub cache_ttl_secs: u64,
    /// Per-node health probe timeout, in seconds.
    pub probe_timeout_secs: u64,
    /// How often the background health refresh pass runs, in seconds.
    pub health_refresh_interval_secs: u64,
    /// Per-attempt dispatch timeout, in seconds.
    pub dispatch_timeout_secs: u64,
    /// Per-attempt timeout for extended-class work, in seconds.
    pub extended_dispatch_timeout_secs: u64,
    /// Credit floor below which a node without free quota is degraded.
    pub degraded_credit_threshold: i64,
    /// Capacity of the background work queue.
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            checkin_min: 15_000,
            checkin_max: 40_000,
            checkin_utc_offset_hours: 8,
            grant_ttl_days: 7,
            cache_ttl_secs: 24 * 60 * 60,
            probe_timeout_secs: 15,
            health_refresh_interval_secs: 60 * 60,
            dispatch_timeout_secs: 60,
            extended_dispatch_timeout_secs: 180,
            degraded_credit_threshold: 50_000,
            queue_depth: 64,
        }
    }
}

impl PoolConfig {
    pub fn load() -> Self {
        let path = default_config_path();
        if let Ok(content) = std::fs::read_to_string(&path)
            && let Ok(config) = serde_json::from_str(&content)
        {
            return config;
        }
        PoolConfig::default()
    }

    pub fn save(&self) -> Result<(), Error> {
        let path = default_config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn checkin_policy(&self) -> CheckInPolicy {
        CheckInPolicy {
            min_amount: self.checkin_min,
            max_amount: self.checkin_max,
            grant_ttl: chrono::Duration::days(self.grant_ttl_days),
            utc_offset_hours: self.checkin_utc_offset_hours,
        }
    }

    pub fn grant_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.grant_ttl_days)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn health_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.health_refresh_interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn extended_dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.extended_dispatch_timeout_secs)
    }
}

/// Default path of the pool configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("QUOTAPOOL_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quotapool")
        .join("pool.json")
}
