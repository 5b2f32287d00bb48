//! Guarding a callable with one or more limiters.

use std::future::Future;
use std::sync::Arc;

use super::key::CallArgs;
use super::limiter::Limiter;
use super::registry::{LimiterId, SharedRegistry};
use crate::error::{CooldownError, Result};

/// The limiters attached to one guarded callable.
///
/// Limiters are applied in attachment order before the callable runs.
/// A rejection is returned unchanged and the callable is not invoked.
#[derive(Debug, Clone, Default)]
pub struct CallSite {
    limiters: Vec<Arc<Limiter>>,
}

impl CallSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a limiter.
    pub fn with(mut self, limiter: Arc<Limiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Attach a shared limiter from `registry`.
    pub fn with_shared(self, registry: &SharedRegistry, id: impl Into<LimiterId>) -> Result<Self> {
        Ok(self.with(registry.get(id)?))
    }

    pub fn limiters(&self) -> &[Arc<Limiter>] {
        &self.limiters
    }

    /// Admit the call through every attached limiter, then invoke `f`.
    pub async fn call<F, Fut, T>(&self, args: CallArgs, f: F) -> Result<T>
    where
        F: FnOnce(CallArgs) -> Fut,
        Fut: Future<Output = T>,
    {
        for limiter in &self.limiters {
            limiter.admit(&args).await?;
        }
        Ok(f(args).await)
    }

    /// The lowest remaining call count across attached limiters.
    pub async fn remaining_calls(&self, args: &CallArgs) -> Result<u32> {
        if self.limiters.is_empty() {
            return Err(CooldownError::NoRegisteredLimiters);
        }

        let mut remaining = u32::MAX;
        for limiter in &self.limiters {
            remaining = remaining.min(limiter.remaining_calls(args).await);
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(limit: u32) -> Arc<Limiter> {
        Arc::new(
            Limiter::builder(limit, Duration::from_secs(10))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_invokes_when_admitted() {
        let site = CallSite::new().with(limiter(1));

        let result = site
            .call(CallArgs::new().arg(2), |args| async move {
                args.positional().len()
            })
            .await;
        assert_eq!(result.unwrap(), 1);

        let mut invoked = false;
        let err = site
            .call(CallArgs::new().arg(2), |_| {
                invoked = true;
                async {}
            })
            .await
            .unwrap_err();
        assert!(err.is_on_cooldown());
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_calls_is_minimum() {
        let site = CallSite::new().with(limiter(3)).with(limiter(5));
        let args = CallArgs::new();

        assert_eq!(site.remaining_calls(&args).await.unwrap(), 3);
        site.call(args.clone(), |_| async {}).await.unwrap();
        assert_eq!(site.remaining_calls(&args).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_no_registered_limiters() {
        let site = CallSite::new();
        let err = site.remaining_calls(&CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, CooldownError::NoRegisteredLimiters));
    }
}
