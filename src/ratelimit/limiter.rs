//! Core limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::cache::{LimiterCache, DEFAULT_CLEAN_INTERVAL};
use super::check::{AdmissionCheck, AlwaysApply, FnCheck};
use super::clock::{Clock, SystemClock};
use super::key::{BucketKey, CallArgs};
use super::policy::ResetPolicy;
use super::registry::LimiterId;
use super::scheduler::{Scheduler, TokioScheduler};
use super::strategy::BucketStrategy;
use super::window::AdmissionWindow;
use crate::error::{CooldownError, Result};

/// Settings applied to windows when they are created.
#[derive(Debug, Clone)]
pub(crate) struct LimiterSettings {
    pub(crate) limit: u32,
    pub(crate) policy: ResetPolicy,
    pub(crate) pending_reset: bool,
}

/// Builder for a [`Limiter`].
#[derive(Clone)]
pub struct LimiterBuilder {
    limit: u32,
    policy: ResetPolicy,
    strategy: BucketStrategy,
    check: Arc<dyn AdmissionCheck>,
    id: Option<LimiterId>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    clean_interval: Duration,
}

impl LimiterBuilder {
    /// Start a limiter admitting `limit` calls per bucket under `policy`.
    pub fn new(limit: u32, policy: impl Into<ResetPolicy>) -> Self {
        Self {
            limit,
            policy: policy.into(),
            strategy: BucketStrategy::default(),
            check: Arc::new(AlwaysApply),
            id: None,
            clock: None,
            scheduler: None,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
        }
    }

    pub fn strategy(mut self, strategy: BucketStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn check(mut self, check: impl AdmissionCheck + 'static) -> Self {
        self.check = Arc::new(check);
        self
    }

    /// Use a synchronous closure as the check predicate.
    pub fn check_fn<F>(self, f: F) -> Self
    where
        F: Fn(&CallArgs) -> bool + Send + Sync + 'static,
    {
        self.check(FnCheck(f))
    }

    pub fn id(mut self, id: impl Into<LimiterId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the delay between background eviction sweeps.
    pub fn clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }

    pub(crate) fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    pub fn limiter_id(&self) -> Option<&LimiterId> {
        self.id.as_ref()
    }

    /// Build the limiter.
    ///
    /// Without an explicit scheduler this captures the current Tokio
    /// runtime and fails outside of one.
    pub fn build(self) -> Result<Limiter> {
        validate_limit(self.limit)?;

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::try_current()?),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };

        Ok(Limiter {
            id: self.id,
            settings: RwLock::new(LimiterSettings {
                limit: self.limit,
                policy: self.policy,
                pending_reset: false,
            }),
            strategy: self.strategy,
            check: self.check,
            cache: Arc::new(LimiterCache::new(self.clean_interval)),
            clock,
            scheduler,
        })
    }
}

fn validate_limit(limit: u32) -> Result<()> {
    if limit == 0 {
        return Err(CooldownError::Config(
            "Limit must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// A rate-limit definition and the state of all of its buckets.
///
/// Each bucket admits up to `limit` calls; every admitted call gives its
/// capacity back once the reset policy says so.
pub struct Limiter {
    id: Option<LimiterId>,
    settings: RwLock<LimiterSettings>,
    strategy: BucketStrategy,
    check: Arc<dyn AdmissionCheck>,
    cache: Arc<LimiterCache>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
}

impl Limiter {
    pub fn builder(limit: u32, policy: impl Into<ResetPolicy>) -> LimiterBuilder {
        LimiterBuilder::new(limit, policy)
    }

    pub fn id(&self) -> Option<&LimiterId> {
        self.id.as_ref()
    }

    pub fn limit(&self) -> u32 {
        self.settings.read().limit
    }

    pub fn policy(&self) -> ResetPolicy {
        self.settings.read().policy.clone()
    }

    pub fn pending_reset(&self) -> bool {
        self.settings.read().pending_reset
    }

    pub fn set_pending_reset(&self, pending_reset: bool) {
        self.settings.write().pending_reset = pending_reset;
    }

    /// Change the limit. Existing windows keep the limit they were created with.
    pub fn set_limit(&self, limit: u32) -> Result<()> {
        validate_limit(limit)?;
        self.settings.write().limit = limit;
        Ok(())
    }

    /// Change the reset policy. Existing windows keep their policy.
    pub fn set_policy(&self, policy: impl Into<ResetPolicy>) {
        self.settings.write().policy = policy.into();
    }

    pub fn strategy(&self) -> &BucketStrategy {
        &self.strategy
    }

    pub fn cache(&self) -> &LimiterCache {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn settings(&self) -> LimiterSettings {
        self.settings.read().clone()
    }

    pub(crate) fn apply_settings(&self, settings: LimiterSettings) {
        *self.settings.write() = settings;
    }

    /// Derive the bucket key for a call.
    pub async fn bucket_key(&self, args: &CallArgs) -> BucketKey {
        self.strategy.derive(args).await
    }

    /// Whether admission control applies to this call.
    pub async fn check_predicate(&self, args: &CallArgs) -> bool {
        self.check.applies(args).await
    }

    /// Admit a call unless its check predicate exempts it.
    pub async fn admit(&self, args: &CallArgs) -> Result<()> {
        if !self.check_predicate(args).await {
            trace!(limiter = ?self.id, "Check predicate bypassed admission control");
            return Ok(());
        }
        self.try_admit(args).await
    }

    /// Admit a call, ignoring the check predicate.
    ///
    /// The key is fully derived before the cache is touched, so a strategy
    /// that suspends cannot interleave with window creation.
    pub async fn try_admit(&self, args: &CallArgs) -> Result<()> {
        let key = self.bucket_key(args).await;
        self.admit_key(key).map(|_| ())
    }

    /// Admit a call for an already derived key.
    ///
    /// Returns when the consumed capacity is replenished.
    pub fn admit_key(&self, key: BucketKey) -> Result<DateTime<Utc>> {
        self.cache.start_sweeper(self.scheduler.as_ref());

        trace!(limiter = ?self.id, key = %key, "Checking admission");

        // admit while the entry is held so a sweep cannot orphan the window
        self.cache
            .with_window(key.clone(), || self.new_window(), |window| {
                window.admit().inspect_err(|_| {
                    debug!(
                        limiter = ?self.id,
                        key = %key,
                        next_reset = ?window.next_reset(),
                        "Call is on cooldown"
                    );
                })
            })
    }

    fn new_window(&self) -> AdmissionWindow {
        let settings = self.settings.read();
        AdmissionWindow::new(
            settings.limit,
            settings.policy.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.scheduler),
        )
    }

    /// Calls the bucket for `args` can still make right now.
    pub async fn remaining_calls(&self, args: &CallArgs) -> u32 {
        let key = self.bucket_key(args).await;
        self.remaining_calls_for(&key)
    }

    pub fn remaining_calls_for(&self, key: &BucketKey) -> u32 {
        match self.cache.lookup(key) {
            Some(window) => window.current_available(),
            None => self.limit(),
        }
    }

    /// The window tracking the bucket for `args`, if one exists.
    pub async fn window(&self, args: &CallArgs) -> Option<Arc<AdmissionWindow>> {
        let key = self.bucket_key(args).await;
        self.cache.lookup(&key)
    }

    /// Evict one bucket, or all of them when `key` is `None`.
    pub fn evict(&self, key: Option<&BucketKey>, force: bool) -> usize {
        let removed = self.cache.evict(key, force);
        debug!(limiter = ?self.id, removed = removed, force = force, "Evicted buckets");
        removed
    }

    /// Drop every bucket, including ones with outstanding calls.
    pub fn reset(&self) -> usize {
        self.evict(None, true)
    }

    /// Get the number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("id", &self.id)
            .field("settings", &*self.settings.read())
            .field("strategy", &self.strategy)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::check::AsyncFnCheck;
    use crate::ratelimit::key::ArgValue;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    fn limiter(limit: u32, secs: u64) -> Limiter {
        Limiter::builder(limit, Duration::from_secs(secs))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_creation() {
        let limiter = limiter(3, 1);
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.limit(), 3);
        assert!(!limiter.cache().sweeper_started());
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected() {
        let err = Limiter::builder(0, Duration::from_secs(1)).build().unwrap_err();
        assert!(matches!(err, CooldownError::Config(_)));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = Limiter::builder(1, Duration::from_secs(1)).build().unwrap_err();
        assert!(matches!(err, CooldownError::Runtime(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_calls_decrease() {
        let limiter = limiter(3, 10);
        let args = CallArgs::new().arg(1);

        assert_eq!(limiter.remaining_calls(&args).await, 3);
        for expected in [2, 1, 0] {
            assert_ok!(limiter.admit(&args).await);
            assert_eq!(limiter.remaining_calls(&args).await, expected);
        }

        let err = assert_err!(limiter.admit(&args).await);
        assert!(err.is_on_cooldown());
        assert_eq!(limiter.remaining_calls(&args).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_separate() {
        let limiter = limiter(1, 10);

        assert_ok!(limiter.admit(&CallArgs::new().arg("a")).await);
        assert_ok!(limiter.admit(&CallArgs::new().arg("b")).await);
        assert_err!(limiter.admit(&CallArgs::new().arg("a")).await);
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_per_second() {
        let limiter = limiter(1, 1);
        let args = CallArgs::new();

        assert_ok!(limiter.admit(&args).await);
        let err = assert_err!(limiter.admit(&args).await);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        sleep(Duration::from_millis(1100)).await;
        assert_ok!(limiter.admit(&args).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_predicate_bypasses_admission() {
        let limiter = Limiter::builder(1, Duration::from_secs(10))
            .check_fn(|args| args.get("admin") != Some(&ArgValue::Bool(true)))
            .build()
            .unwrap();
        let admin = CallArgs::new().named("admin", true);

        for _ in 0..5 {
            assert_ok!(limiter.admit(&admin).await);
        }
        assert_eq!(limiter.bucket_count(), 0);

        // try_admit ignores the predicate
        assert_ok!(limiter.try_admit(&admin).await);
        assert_err!(limiter.try_admit(&admin).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_check_predicate() {
        let limiter = Limiter::builder(1, Duration::from_secs(10))
            .check(AsyncFnCheck(|args: CallArgs| async move {
                tokio::task::yield_now().await;
                args.positional().first() != Some(&ArgValue::Int(0))
            }))
            .build()
            .unwrap();

        assert!(!limiter.check_predicate(&CallArgs::new().arg(0)).await);
        assert!(limiter.check_predicate(&CallArgs::new().arg(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_admission_starts_sweeper() {
        let limiter = limiter(1, 1);
        limiter.admit(&CallArgs::new()).await.unwrap();
        assert!(limiter.cache().sweeper_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_change_applies_to_new_windows() {
        let limiter = limiter(1, 10);
        let a = CallArgs::new().arg("a");
        let b = CallArgs::new().arg("b");

        limiter.admit(&a).await.unwrap();
        limiter.set_policy(Duration::from_secs(1));
        limiter.set_limit(2).unwrap();
        limiter.admit(&b).await.unwrap();

        let window_a = limiter.window(&a).await.unwrap();
        let window_b = limiter.window(&b).await.unwrap();
        assert_eq!(window_a.limit(), 1);
        assert_eq!(window_a.policy().period(), Duration::from_secs(10));
        assert_eq!(window_b.limit(), 2);
        assert_eq!(window_b.policy().period(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drops_outstanding_buckets() {
        let limiter = limiter(1, 10);
        let args = CallArgs::new().arg(1);
        limiter.admit(&args).await.unwrap();

        assert_eq!(limiter.evict(None, false), 0);
        assert_eq!(limiter.reset(), 1);
        assert_ok!(limiter.admit(&args).await);
    }
}
