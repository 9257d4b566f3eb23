//! Operator-facing configuration (SPEC_FULL §1 "Configuration"): the named
//! constants of spec.md §9 plus store backend selection, mirroring
//! `reqpool`'s `RedisPoolConfig` shape — a small `serde`-deserializable
//! struct with sensible defaults, no hidden global state.

use serde::Deserialize;
use warden_dispatch::DispatcherConfig;
use warden_store::StoreConfig;

/// Everything needed to stand up a [`crate::TaskScheduler`]: which store
/// backend to open and how the dispatcher should pace itself.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_tasks_in_interval")]
    pub max_tasks_in_interval: u32,

    #[serde(default = "default_cleanup_intervals")]
    pub cleanup_intervals: u32,
}

fn default_pool_size() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    warden_lib::POLL_INTERVAL_MS
}

fn default_max_tasks_in_interval() -> u32 {
    warden_lib::MAX_TASKS_IN_INTERVAL
}

fn default_cleanup_intervals() -> u32 {
    warden_lib::CLEANUP_INTERVALS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            store: StoreConfig::default(),
            pool_size: default_pool_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_tasks_in_interval: default_max_tasks_in_interval(),
            cleanup_intervals: default_cleanup_intervals(),
        }
    }
}

impl SchedulerConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            pool_size: self.pool_size,
            poll_interval_ms: self.poll_interval_ms,
            max_tasks_in_interval: self.max_tasks_in_interval,
            cleanup_intervals: self.cleanup_intervals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_ms, warden_lib::POLL_INTERVAL_MS);
        assert_eq!(config.max_tasks_in_interval, warden_lib::MAX_TASKS_IN_INTERVAL);
        assert_eq!(config.cleanup_intervals, warden_lib::CLEANUP_INTERVALS);
    }

    #[test]
    fn deserializes_partial_overrides() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"pool_size": 8}"#).unwrap();
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.poll_interval_ms, warden_lib::POLL_INTERVAL_MS);
    }
}
