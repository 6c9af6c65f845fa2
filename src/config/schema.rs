//! Configuration schema for jobcache
//!
//! Configuration is stored at `~/.config/jobcache/config.toml`

use crate::error::{JobCacheError, JobCacheResult};
use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local cache settings
    pub cache: CacheConfig,

    /// Remote cache tier
    pub remote: RemoteConfig,

    /// Dispatch settings
    pub scheduler: SchedulerConfig,

    /// Defaults for the `simulate` command
    pub simulate: SimulateConfig,
}

impl Config {
    /// Reject settings the cache cannot honor
    pub fn validate(&self) -> JobCacheResult<()> {
        let reduce = self.cache.overflow_reduce_percent;
        if reduce == 0 || reduce > 100 {
            return Err(JobCacheError::setting(
                "cache.overflow_reduce_percent",
                format!("{} is outside 1..=100", reduce),
            ));
        }
        if self.cache.shard_bits > 12 {
            return Err(JobCacheError::setting(
                "cache.shard_bits",
                format!("{} exceeds the maximum of 12", self.cache.shard_bits),
            ));
        }
        if self.general.log_format != "text" && self.general.log_format != "json" {
            return Err(JobCacheError::setting(
                "general.log_format",
                format!("expected \"text\" or \"json\", got {:?}", self.general.log_format),
            ));
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Local cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on stored output memory in MB (0 = unlimited)
    pub max_memory_mb: u64,

    /// Culling shrinks stored outputs to this percent of the budget
    pub overflow_reduce_percent: u8,

    /// Shard count for the job table and cache index is `1 << shard_bits`
    pub shard_bits: u8,

    /// Execute every job and compare outputs that share an input hash
    pub debug_validate: bool,

    /// Never record completed outputs (forces re-execution)
    pub discard_outputs: bool,
}

impl CacheConfig {
    /// Memory budget in bytes, `None` when unlimited
    pub fn memory_budget_bytes(&self) -> Option<usize> {
        if self.max_memory_mb == 0 {
            return None;
        }
        let bytes = self.max_memory_mb.saturating_mul(1024 * 1024);
        Some(usize::try_from(bytes).unwrap_or(usize::MAX))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 16 * 1024,
            overflow_reduce_percent: 80,
            shard_bits: 6,
            debug_validate: false,
            discard_outputs: false,
        }
    }
}

/// Remote cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Query the remote store on local misses
    pub enabled: bool,

    /// Push newly computed outputs to the remote store
    pub write_through: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            write_through: true,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Randomly skip ahead when pulling partial batches below High priority
    pub randomize_batches: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            randomize_batches: true,
        }
    }
}

/// Synthetic workload defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Worker threads pulling from the pending queue
    pub workers: usize,

    /// Jobs to submit
    pub jobs: usize,

    /// Distinct input hashes among the submitted jobs
    pub distinct_inputs: usize,

    /// Maximum jobs per worker pull
    pub batch_size: usize,

    /// Size of each synthetic output in bytes
    pub output_bytes: usize,

    /// Simulated execution time per job in microseconds
    pub work_micros: u64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            jobs: 10_000,
            distinct_inputs: 1_000,
            batch_size: 16,
            output_bytes: 4096,
            work_micros: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.overflow_reduce_percent, 80);
        assert_eq!(
            config.cache.memory_budget_bytes(),
            Some(16 * 1024 * 1024 * 1024)
        );
    }

    #[test]
    fn zero_memory_means_unlimited() {
        let cache = CacheConfig {
            max_memory_mb: 0,
            ..CacheConfig::default()
        };
        assert_eq!(cache.memory_budget_bytes(), None);
    }

    #[test]
    fn rejects_bad_reduce_percent() {
        let mut config = Config::default();
        config.cache.overflow_reduce_percent = 0;
        assert!(config.validate().is_err());
        config.cache.overflow_reduce_percent = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        let mut config = Config::default();
        config.general.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[cache]\nmax_memory_mb = 64\n").unwrap();
        assert_eq!(config.cache.max_memory_mb, 64);
        assert_eq!(config.cache.shard_bits, 6);
        assert!(config.remote.enabled);
    }
}
