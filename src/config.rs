//! Engine configuration
//!
//! Defaults for discovery runs, overridable from the environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::options::{DiscoveryOptions, DEFAULT_CACHE_TTL, DEFAULT_MAX_CONCURRENCY, DEFAULT_TIMEOUT};
use crate::types::CloudProvider;

pub const ENV_MAX_CONCURRENCY: &str = "DISCOVERY_MAX_CONCURRENCY";
pub const ENV_TIMEOUT_SECS: &str = "DISCOVERY_TIMEOUT_SECS";
pub const ENV_CACHE_TTL_SECS: &str = "DISCOVERY_CACHE_TTL_SECS";
pub const ENV_CACHE_CAPACITY: &str = "DISCOVERY_CACHE_CAPACITY";

/// Engine-wide defaults applied to new discovery requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently active connector calls
    pub max_concurrency: usize,
    /// Per-call timeout
    #[serde(with = "crate::options::secs")]
    pub timeout: Duration,
    /// Lifetime of cached results
    #[serde(with = "crate::options::secs")]
    pub cache_ttl: Duration,
    /// Maximum number of cached results held in memory
    pub cache_capacity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `DISCOVERY_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            max_concurrency: positive(&lookup, ENV_MAX_CONCURRENCY)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_concurrency),
            timeout: positive(&lookup, ENV_TIMEOUT_SECS)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            cache_ttl: positive(&lookup, ENV_CACHE_TTL_SECS)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            cache_capacity: positive(&lookup, ENV_CACHE_CAPACITY).unwrap_or(defaults.cache_capacity),
        }
    }

    /// Options for `providers` carrying this config's limits
    pub fn options_for(&self, providers: impl IntoIterator<Item = CloudProvider>) -> DiscoveryOptions {
        DiscoveryOptions::new(providers)
            .max_concurrency(self.max_concurrency)
            .timeout(self.timeout)
            .cache_ttl(self.cache_ttl)
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(key, value = %raw, "Ignoring invalid value, using default");
            None
        }
    }
}
