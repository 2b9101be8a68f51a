// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Configuration Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Tunables of the sliding sync engine: long-poll timeouts, the density
//   threshold that collapses incremental window updates into a SYNC, and the
//   bounds of the per-connection window cache. Loaded from TOML and
//   `MATRIXON_SLIDING_SYNC_*` environment variables through figment.
//
// =============================================================================

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Environment prefix for every configuration key
pub const ENV_PREFIX: &str = "MATRIXON_SLIDING_SYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingSyncConfig {
    /// Long-poll timeout used when a request names none
    pub default_timeout_ms: u64,

    /// Upper clamp applied to requested timeouts
    pub max_timeout_ms: u64,

    /// A range whose changed share exceeds this percentage is re-sent as one SYNC
    pub collapse_threshold_percent: u8,

    /// Capacity of the window tracker's connection cache
    pub max_connections: usize,

    pub max_connections_per_user: usize,

    pub connection_idle_timeout_secs: u64,

    pub cleanup_interval_secs: u64,

    pub max_ranges_per_list: usize,

    pub max_lists: usize,

    pub max_room_subscriptions: usize,

    /// `tracing` filter directive
    pub log: String,
}

impl Default for SlidingSyncConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 30_000,
            collapse_threshold_percent: 50,
            max_connections: 10_000,
            max_connections_per_user: 10,
            connection_idle_timeout_secs: 30 * 60,
            cleanup_interval_secs: 60,
            max_ranges_per_list: 16,
            max_lists: 32,
            max_room_subscriptions: 100,
            log: "info".to_owned(),
        }
    }
}

impl SlidingSyncConfig {
    /// Load defaults, then the TOML file if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(SlidingSyncConfig::default()));

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        let config: SlidingSyncConfig = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_timeout_ms == 0 {
            return Err(Error::BadConfig("max_timeout_ms must be positive".to_owned()));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(Error::BadConfig(format!(
                "default_timeout_ms ({}) exceeds max_timeout_ms ({})",
                self.default_timeout_ms, self.max_timeout_ms
            )));
        }
        if self.collapse_threshold_percent > 100 {
            return Err(Error::BadConfig(
                "collapse_threshold_percent must be within 0..=100".to_owned(),
            ));
        }
        if self.max_connections == 0 || self.max_connections_per_user == 0 {
            return Err(Error::BadConfig(
                "connection capacities must be positive".to_owned(),
            ));
        }
        if self.max_ranges_per_list == 0 || self.max_lists == 0 {
            return Err(Error::BadConfig("list bounds must be positive".to_owned()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::BadConfig("cleanup_interval_secs must be positive".to_owned()));
        }
        if self.collapse_threshold_percent == 0 {
            warn!("⚠️ collapse_threshold_percent is 0: every changed range is re-sent as SYNC");
        }
        Ok(())
    }

    /// Timeout for one request: the requested value (or the default), capped.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let requested = requested.unwrap_or(Duration::from_millis(self.default_timeout_ms));
        requested.min(self.max_timeout())
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_config_default_is_valid() {
        let config = SlidingSyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collapse_threshold_percent, 50);
        assert_eq!(config.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SlidingSyncConfig::default();
        config.collapse_threshold_percent = 101;
        assert!(config.validate().is_err());

        let mut config = SlidingSyncConfig::default();
        config.default_timeout_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = SlidingSyncConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_timeout_is_clamped() {
        let config = SlidingSyncConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_load_merges_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sliding_sync.toml",
                r#"
                collapse_threshold_percent = 75
                max_lists = 4
                "#,
            )?;
            jail.set_env("MATRIXON_SLIDING_SYNC_MAX_LISTS", "8");

            let config = SlidingSyncConfig::load(Some(Path::new("sliding_sync.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.collapse_threshold_percent, 75);
            assert_eq!(config.max_lists, 8);
            assert_eq!(config.max_timeout_ms, 30_000);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        Jail::expect_with(|jail| {
            jail.set_env("MATRIXON_SLIDING_SYNC_COLLAPSE_THRESHOLD_PERCENT", "150");
            assert!(SlidingSyncConfig::load(None).is_err());
            Ok(())
        });
    }
}
