//! Snapshot and restore of limiter state.
//!
//! A snapshot records every bucket's remaining capacity together with the
//! wall-clock times of its pending replenishments. Restoring reconciles
//! those times against the current clock: replenishments that fell due
//! while the state was stored are applied immediately, the rest are
//! rescheduled.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::key::BucketKey;
use super::limiter::{Limiter, LimiterSettings};
use super::policy::ResetPolicy;
use super::registry::LimiterId;
use super::window::AdmissionWindow;
use crate::error::{CooldownError, Result};

/// Current persisted state format.
pub const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub limit: u32,
    pub period_seconds: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reset_times: Vec<NaiveTime>,
    pub current_available: u32,
    /// Epoch seconds of pending replenishments, oldest first
    pub pending_resets: Vec<f64>,
}

/// Persisted state of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub limit: u32,
    pub period_seconds: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reset_times: Vec<NaiveTime>,
    pub pending_reset: bool,
    pub limiter_id: Option<LimiterId>,
    /// Buckets indexed by encoded key
    #[serde(default)]
    pub cache: BTreeMap<String, BucketState>,
}

impl LimiterState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let state: LimiterState = serde_json::from_str(json)?;
        if state.version != STATE_VERSION {
            return Err(CooldownError::State(format!(
                "Unsupported state version {}",
                state.version
            )));
        }
        Ok(state)
    }

    /// Write the state as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read state written by [`LimiterState::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn policy(&self) -> Result<ResetPolicy> {
        policy_from(self.period_seconds, &self.reset_times)
    }
}

impl BucketState {
    pub fn policy(&self) -> Result<ResetPolicy> {
        policy_from(self.period_seconds, &self.reset_times)
    }

    /// Pending replenishments as timestamps.
    pub fn resets(&self) -> Result<Vec<DateTime<Utc>>> {
        self.pending_resets.iter().map(|e| from_epoch(*e)).collect()
    }
}

fn policy_from(period_seconds: f64, reset_times: &[NaiveTime]) -> Result<ResetPolicy> {
    if reset_times.is_empty() {
        ResetPolicy::from_secs_f64(period_seconds)
    } else {
        ResetPolicy::daily(reset_times.to_vec())
    }
}

fn to_epoch(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn from_epoch(epoch: f64) -> Result<DateTime<Utc>> {
    let micros = (epoch * 1_000_000.0).round() as i64;
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| CooldownError::State(format!("Invalid reset timestamp {}", epoch)))
}

/// Capture the full state of a limiter.
pub fn snapshot(limiter: &Limiter) -> Result<LimiterState> {
    let settings = limiter.settings();

    let mut cache = BTreeMap::new();
    for (key, window) in limiter.cache().entries() {
        let (current_available, pending) = window.state_snapshot();
        cache.insert(
            key.encode()?,
            BucketState {
                limit: window.limit(),
                period_seconds: window.policy().period().as_secs_f64(),
                reset_times: window.policy().reset_times().to_vec(),
                current_available,
                pending_resets: pending.into_iter().map(to_epoch).collect(),
            },
        );
    }

    Ok(LimiterState {
        version: STATE_VERSION,
        limit: settings.limit,
        period_seconds: settings.policy.period().as_secs_f64(),
        reset_times: settings.policy.reset_times().to_vec(),
        pending_reset: settings.pending_reset,
        limiter_id: limiter.id().cloned(),
        cache,
    })
}

/// Replace a limiter's settings and buckets with `state`.
///
/// The whole state is validated before anything is changed.
pub fn restore(limiter: &Limiter, state: &LimiterState) -> Result<()> {
    if state.limit == 0 {
        return Err(CooldownError::State("Limit must be greater than zero".to_string()));
    }
    if state.limiter_id.as_ref() != limiter.id() {
        warn!(
            limiter = ?limiter.id(),
            state = ?state.limiter_id,
            "Restoring state recorded for a different limiter"
        );
    }

    let policy = state.policy()?;

    let mut decoded = Vec::with_capacity(state.cache.len());
    for (encoded, bucket) in &state.cache {
        let key = BucketKey::decode(encoded)?;
        if bucket.limit == 0 {
            return Err(CooldownError::State(format!(
                "Bucket {} has a zero limit",
                key
            )));
        }
        if bucket.pending_resets.len() as u64 + bucket.current_available as u64
            != bucket.limit as u64
        {
            warn!(
                key = %key,
                limit = bucket.limit,
                current_available = bucket.current_available,
                pending = bucket.pending_resets.len(),
                "Bucket state does not account for every call"
            );
        }
        decoded.push((key, bucket.policy()?, bucket.resets()?, bucket));
    }

    limiter.apply_settings(LimiterSettings {
        limit: state.limit,
        policy,
        pending_reset: state.pending_reset,
    });

    let windows: Vec<(BucketKey, Arc<AdmissionWindow>)> = decoded
        .into_iter()
        .map(|(key, policy, resets, bucket)| {
            let window = AdmissionWindow::restore(
                bucket.limit,
                policy,
                bucket.current_available,
                &resets,
                Arc::clone(limiter.clock()),
                Arc::clone(limiter.scheduler()),
            );
            (key, window)
        })
        .collect();

    info!(
        limiter = ?limiter.id(),
        buckets = windows.len(),
        "Restored limiter state"
    );
    limiter.cache().replace_all(windows);
    Ok(())
}

impl Limiter {
    /// Capture this limiter's state. See [`snapshot`].
    pub fn snapshot(&self) -> Result<LimiterState> {
        snapshot(self)
    }

    /// Load previously captured state. See [`restore`].
    pub fn restore(&self, state: &LimiterState) -> Result<()> {
        restore(self, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::CallArgs;
    use chrono::TimeZone;
    use std::time::Duration;
    use tokio::time::sleep;

    #[test]
    fn test_epoch_conversion() {
        let at = Utc.with_ymd_and_hms(2023, 2, 14, 3, 30, 1).unwrap()
            + chrono::Duration::microseconds(250_500);
        assert_eq!(from_epoch(to_epoch(at)).unwrap(), at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_snapshot() {
        let limiter = Limiter::builder(1, Duration::from_secs(30))
            .id(1)
            .build()
            .unwrap();

        let state = limiter.snapshot().unwrap();
        assert_eq!(state.limit, 1);
        assert_eq!(state.period_seconds, 30.0);
        assert!(!state.pending_reset);
        assert_eq!(state.limiter_id, Some(LimiterId::Int(1)));
        assert!(state.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_records_pending_resets() {
        let limiter = Limiter::builder(2, Duration::from_secs(30)).build().unwrap();
        limiter.admit(&CallArgs::new().arg(1)).await.unwrap();

        let state = limiter.snapshot().unwrap();
        assert_eq!(state.cache.len(), 1);
        let bucket = state.cache.values().next().unwrap();
        assert_eq!(bucket.current_available, 1);
        assert_eq!(bucket.pending_resets.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_after_replenish_has_no_pending() {
        let limiter = Limiter::builder(1, Duration::from_millis(100)).build().unwrap();
        limiter.admit(&CallArgs::new().arg(1)).await.unwrap();

        sleep(Duration::from_millis(200)).await;

        let state = limiter.snapshot().unwrap();
        for bucket in state.cache.values() {
            assert_eq!(bucket.current_available, bucket.limit);
            assert!(bucket.pending_resets.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rejects_bad_keys() {
        let limiter = Limiter::builder(1, Duration::from_secs(1)).build().unwrap();
        let mut state = limiter.snapshot().unwrap();
        state.cache.insert(
            "not-a-key".to_string(),
            BucketState {
                limit: 1,
                period_seconds: 1.0,
                reset_times: Vec::new(),
                current_available: 1,
                pending_resets: Vec::new(),
            },
        );
        state.limit = 5;

        assert!(matches!(limiter.restore(&state), Err(CooldownError::State(_))));
        // nothing was applied
        assert_eq!(limiter.limit(), 1);
    }

    #[test]
    fn test_from_json_rejects_unknown_version() {
        let json = r#"{"version": 2, "limit": 1, "period_seconds": 1.0,
            "pending_reset": false, "limiter_id": null, "cache": {}}"#;
        assert!(matches!(
            LimiterState::from_json(json),
            Err(CooldownError::State(_))
        ));
    }

    #[test]
    fn test_from_json_defaults_version() {
        let json = r#"{"limit": 1, "period_seconds": 1.0,
            "pending_reset": true, "limiter_id": "x", "cache": {}}"#;
        let state = LimiterState::from_json(json).unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.limiter_id, Some(LimiterId::from("x")));
        assert!(state.pending_reset);
    }
}
