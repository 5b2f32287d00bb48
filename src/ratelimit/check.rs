//! Predicates deciding whether admission control applies to a call.

use std::future::Future;

use async_trait::async_trait;

use super::key::CallArgs;

/// Decides whether a limiter applies to a call at all.
///
/// Returning `false` exempts the call from admission control.
#[async_trait]
pub trait AdmissionCheck: Send + Sync {
    async fn applies(&self, args: &CallArgs) -> bool;
}

/// Applies admission control to every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysApply;

#[async_trait]
impl AdmissionCheck for AlwaysApply {
    async fn applies(&self, _args: &CallArgs) -> bool {
        true
    }
}

/// Adapts a synchronous closure into an [`AdmissionCheck`].
pub struct FnCheck<F>(pub F);

#[async_trait]
impl<F> AdmissionCheck for FnCheck<F>
where
    F: Fn(&CallArgs) -> bool + Send + Sync,
{
    async fn applies(&self, args: &CallArgs) -> bool {
        (self.0)(args)
    }
}

/// Adapts a closure returning a future into an [`AdmissionCheck`].
pub struct AsyncFnCheck<F>(pub F);

#[async_trait]
impl<F, Fut> AdmissionCheck for AsyncFnCheck<F>
where
    F: Fn(CallArgs) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn applies(&self, args: &CallArgs) -> bool {
        (self.0)(args.clone()).await
    }
}
