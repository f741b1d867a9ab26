//! Typed configuration, loaded from a TOML file and overridable by
//! environment variables (SPEC_FULL.md §10.4).
//!
//! Grounded in the `config` crate usage in the BGP-domain example `monocle`
//! (`examples/other_examples/manifests/bgpkit-monocle/Cargo.toml`, which
//! pins the same `toml`-feature layered-config pattern used here).

use crate::error::{IpasnError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Redis connection URL for the ephemeral cache store.
    #[serde(default = "default_cache_url")]
    pub cache_redis_url: String,

    /// Redis connection URL for the durable storage store.
    #[serde(default = "default_storage_url")]
    pub storage_redis_url: String,

    /// Configured sources, in priority order (spec §4.3 "sources").
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,

    /// Overall horizon the fleet must cover backward from today (spec
    /// §4.3 "days_in_memory").
    #[serde(default = "default_days_in_memory")]
    pub days_in_memory: i64,

    /// Per-worker date span (spec §4.3 "floating_window_days").
    #[serde(default = "default_floating_window_days")]
    pub floating_window_days: i64,

    /// How often the manager re-evaluates its spawn schedule (spec §4.3
    /// "tick, every ~1 h").
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Address the HTTP frontend binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cache_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_storage_url() -> String {
    "redis://127.0.0.1:6380/0".to_string()
}
fn default_sources() -> Vec<String> {
    vec!["caida".to_string()]
}
fn default_days_in_memory() -> i64 {
    180
}
fn default_floating_window_days() -> i64 {
    8
}
fn default_tick_interval_secs() -> u64 {
    3600
}
fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_redis_url: default_cache_url(),
            storage_redis_url: default_storage_url(),
            sources: default_sources(),
            days_in_memory: default_days_in_memory(),
            floating_window_days: default_floating_window_days(),
            tick_interval_secs: default_tick_interval_secs(),
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (if it exists) layered with
    /// `IPASND_*` environment overrides, falling back to defaults for
    /// anything unset.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).map_err(config_err)?);

        let path = path.as_ref();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("IPASND")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(config_err)?;
        cfg.try_deserialize().map_err(config_err)
    }
}

fn config_err(e: config::ConfigError) -> IpasnError {
    IpasnError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.days_in_memory, 180);
        assert_eq!(cfg.sources, vec!["caida".to_string()]);
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let cfg = Config::load("/nonexistent/ipasnd.toml").unwrap();
        assert_eq!(cfg.bind_addr, default_bind_addr());
    }
}
