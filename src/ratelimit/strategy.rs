//! Bucket strategies: how a call's arguments map to a bucket key.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use super::key::{ArgValue, BucketKey, CallArgs};
use crate::error::CooldownError;

/// Derives the raw key material for a custom bucket strategy.
///
/// Implementations may suspend, e.g. to look an identifier up elsewhere.
#[async_trait]
pub trait KeyExtractor: Send + Sync {
    /// Extract the value identifying the bucket for these arguments.
    async fn extract(&self, args: &CallArgs) -> ArgValue;
}

struct FnExtractor<F>(F);

#[async_trait]
impl<F> KeyExtractor for FnExtractor<F>
where
    F: Fn(&CallArgs) -> ArgValue + Send + Sync,
{
    async fn extract(&self, args: &CallArgs) -> ArgValue {
        (self.0)(args)
    }
}

struct AsyncFnExtractor<F>(F);

#[async_trait]
impl<F, Fut> KeyExtractor for AsyncFnExtractor<F>
where
    F: Fn(CallArgs) -> Fut + Send + Sync,
    Fut: Future<Output = ArgValue> + Send,
{
    async fn extract(&self, args: &CallArgs) -> ArgValue {
        (self.0)(args.clone()).await
    }
}

/// Policy deriving a [`BucketKey`] from call arguments.
#[derive(Clone, Default)]
pub enum BucketStrategy {
    /// Positional and named arguments
    #[default]
    All,
    /// Positional arguments only
    PositionalOnly,
    /// Named arguments only
    NamedOnly,
    /// A single value produced by an extractor
    Custom(Arc<dyn KeyExtractor>),
}

impl BucketStrategy {
    /// Build a custom strategy from a synchronous closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CallArgs) -> ArgValue + Send + Sync + 'static,
    {
        BucketStrategy::Custom(Arc::new(FnExtractor(f)))
    }

    /// Build a custom strategy from a closure returning a future.
    pub fn custom_async<F, Fut>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ArgValue> + Send + 'static,
    {
        BucketStrategy::Custom(Arc::new(AsyncFnExtractor(f)))
    }

    /// Derive the bucket key for a call.
    pub async fn derive(&self, args: &CallArgs) -> BucketKey {
        match self {
            BucketStrategy::All => {
                BucketKey::new(args.positional().to_vec(), args.named_values().clone())
            }
            BucketStrategy::PositionalOnly => {
                BucketKey::new(args.positional().to_vec(), Default::default())
            }
            BucketStrategy::NamedOnly => {
                BucketKey::new(Vec::new(), args.named_values().clone())
            }
            BucketStrategy::Custom(extractor) => BucketKey::single(extractor.extract(args).await),
        }
    }
}

impl fmt::Debug for BucketStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketStrategy::All => write!(f, "All"),
            BucketStrategy::PositionalOnly => write!(f, "PositionalOnly"),
            BucketStrategy::NamedOnly => write!(f, "NamedOnly"),
            BucketStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl FromStr for BucketStrategy {
    type Err = CooldownError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(BucketStrategy::All),
            "positional" | "positional_only" | "args" => Ok(BucketStrategy::PositionalOnly),
            "named" | "named_only" | "kwargs" => Ok(BucketStrategy::NamedOnly),
            _ => Err(CooldownError::UnknownBucketStrategy(s.to_string())),
        }
    }
}
