//! Configuration management for cooldowns.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CooldownError, Result};
use crate::ratelimit::{
    BucketStrategy, DailyResetTimes, Limiter, LimiterBuilder, LimiterId, ResetPolicy,
    SharedRegistry, TimeWindow, DEFAULT_CLEAN_INTERVAL,
};

/// Main configuration: cache tuning and a list of limiter definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownsConfig {
    /// Bucket cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Limiter definitions
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

/// Bucket cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds between background eviction sweeps
    #[serde(default = "default_clean_interval")]
    pub clean_eviction_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clean_eviction_interval_secs: default_clean_interval(),
        }
    }
}

fn default_clean_interval() -> u64 {
    DEFAULT_CLEAN_INTERVAL.as_secs()
}

impl CacheConfig {
    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_eviction_interval_secs)
    }
}

/// One limiter definition.
///
/// Exactly one of `period_secs`, `unit` and `reset_times` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Shared id; required when registering
    #[serde(default)]
    pub id: Option<LimiterId>,

    /// Calls admitted per bucket
    pub limit: u32,

    /// Fixed period in seconds
    #[serde(default)]
    pub period_secs: Option<f64>,

    /// Fixed period as a named unit
    #[serde(default)]
    pub unit: Option<TimeWindow>,

    /// Daily UTC reset times, `HH:MM[:SS]`
    #[serde(default)]
    pub reset_times: Vec<String>,

    /// Bucket strategy name
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "all".to_string()
}

impl LimiterConfig {
    /// Resolve the configured period.
    pub fn policy(&self) -> Result<ResetPolicy> {
        match (self.period_secs, self.unit, self.reset_times.is_empty()) {
            (Some(secs), None, true) => ResetPolicy::from_secs_f64(secs),
            (None, Some(unit), true) => Ok(unit.into()),
            (None, None, false) => {
                DailyResetTimes::parse(&self.reset_times).map(ResetPolicy::Daily)
            }
            (None, None, true) => Err(CooldownError::Config(format!(
                "Limiter {} needs one of period_secs, unit or reset_times",
                self.display_id()
            ))),
            _ => Err(CooldownError::Config(format!(
                "Limiter {} sets more than one of period_secs, unit and reset_times",
                self.display_id()
            ))),
        }
    }

    /// Turn this definition into a limiter builder.
    pub fn builder(&self, cache: &CacheConfig) -> Result<LimiterBuilder> {
        if self.limit == 0 {
            return Err(CooldownError::Config(format!(
                "Limiter {} must have a limit greater than zero",
                self.display_id()
            )));
        }
        let strategy: BucketStrategy = self.strategy.parse()?;

        let mut builder = Limiter::builder(self.limit, self.policy()?)
            .strategy(strategy)
            .clean_interval(cache.clean_interval());
        if let Some(id) = &self.id {
            builder = builder.id(id.clone());
        }
        Ok(builder)
    }

    fn display_id(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

impl CooldownsConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading cooldowns configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CooldownError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Define every configured limiter in `registry`.
    pub fn register_all(&self, registry: &SharedRegistry) -> Result<Vec<Arc<Limiter>>> {
        self.limiters
            .iter()
            .map(|limiter| {
                let id = limiter.id.clone().ok_or_else(|| {
                    CooldownError::Config("Shared limiters need an id".to_string())
                })?;
                registry.define(id, limiter.builder(&self.cache)?)
            })
            .collect()
    }
}
