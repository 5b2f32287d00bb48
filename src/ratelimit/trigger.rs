//! Limiter with a manually triggered cooldown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::key::CallArgs;
use super::limiter::{Limiter, LimiterBuilder};
use super::policy::ResetPolicy;
use crate::error::Result;

/// A normal limiter paired with a cooldown that can be triggered on demand.
///
/// After [`TriggerLimiter::trigger`], calls whose bucket is still held by the
/// triggered cooldown are rejected. Each bucket is routed on its own: once
/// its triggered cooldown has capacity again, the normal limiter applies.
#[derive(Debug)]
pub struct TriggerLimiter {
    normal: Arc<Limiter>,
    triggered_limiter: Arc<Limiter>,
}

impl TriggerLimiter {
    /// Build both limiters from one definition.
    ///
    /// The triggered cooldown shares the strategy and check, admits a single
    /// call, and is never registered under the definition's id.
    pub fn new(builder: LimiterBuilder) -> Result<Self> {
        let triggered_limiter = builder.clone().without_id().limit(1).build()?;
        Ok(Self {
            normal: Arc::new(builder.build()?),
            triggered_limiter: Arc::new(triggered_limiter),
        })
    }

    pub fn normal(&self) -> &Arc<Limiter> {
        &self.normal
    }

    pub fn triggered_limiter(&self) -> &Arc<Limiter> {
        &self.triggered_limiter
    }

    /// Whether the bucket for `args` is held by a triggered cooldown.
    pub async fn is_triggered(&self, args: &CallArgs) -> bool {
        self.triggered_limiter.remaining_calls(args).await < 1
    }

    /// Put the bucket for `args` on cooldown for `period`.
    ///
    /// Fails with `OnCooldown` if that bucket is already triggered.
    pub async fn trigger(&self, period: Duration, args: &CallArgs) -> Result<()> {
        let key = self.triggered_limiter.bucket_key(args).await;
        self.triggered_limiter.set_policy(ResetPolicy::every(period));
        // an idle window would keep the previous period
        self.triggered_limiter.evict(Some(&key), false);

        debug!(key = %key, period = ?period, "Triggered cooldown");
        self.triggered_limiter.admit_key(key).map(|_| ())
    }

    /// Admit a call through whichever cooldown currently applies.
    pub async fn admit(&self, args: &CallArgs) -> Result<()> {
        if !self.normal.check_predicate(args).await {
            return Ok(());
        }

        if self.is_triggered(args).await {
            return self.triggered_limiter.try_admit(args).await;
        }
        self.normal.try_admit(args).await
    }

    /// Admit the call, then invoke `f`.
    pub async fn call<F, Fut, T>(&self, args: CallArgs, f: F) -> Result<T>
    where
        F: FnOnce(CallArgs) -> Fut,
        Fut: Future<Output = T>,
    {
        self.admit(&args).await?;
        Ok(f(args).await)
    }
}
