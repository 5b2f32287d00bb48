//! Shared limiters addressable by identifier.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::limiter::{Limiter, LimiterBuilder};
use crate::error::{CooldownError, Result};

/// Identifier of a shared limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimiterId {
    Int(i64),
    Name(String),
}

impl fmt::Display for LimiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterId::Int(id) => write!(f, "{}", id),
            LimiterId::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<i64> for LimiterId {
    fn from(id: i64) -> Self {
        LimiterId::Int(id)
    }
}

impl From<i32> for LimiterId {
    fn from(id: i32) -> Self {
        LimiterId::Int(id as i64)
    }
}

impl From<&str> for LimiterId {
    fn from(name: &str) -> Self {
        LimiterId::Name(name.to_string())
    }
}

impl From<String> for LimiterId {
    fn from(name: String) -> Self {
        LimiterId::Name(name)
    }
}

/// Process-wide table of shared limiters.
///
/// Entries are only added through [`SharedRegistry::define`] and are never
/// removed implicitly. Hold one instance for the lifetime of the process
/// and pass it to every call site that needs shared limiters.
#[derive(Default)]
pub struct SharedRegistry {
    limiters: RwLock<HashMap<LimiterId, Arc<Limiter>>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a limiter under `id`.
    ///
    /// Fails with [`CooldownError::AlreadyExists`] if `id` is taken.
    pub fn define(&self, id: impl Into<LimiterId>, builder: LimiterBuilder) -> Result<Arc<Limiter>> {
        let id = id.into();
        let mut limiters = self.limiters.write();
        if limiters.contains_key(&id) {
            return Err(CooldownError::AlreadyExists(id));
        }

        let limiter = Arc::new(builder.id(id.clone()).build()?);
        info!(
            limiter = %id,
            limit = limiter.limit(),
            policy = ?limiter.policy(),
            "Defined shared limiter"
        );
        limiters.insert(id, Arc::clone(&limiter));
        Ok(limiter)
    }

    /// Get a shared limiter.
    pub fn get(&self, id: impl Into<LimiterId>) -> Result<Arc<Limiter>> {
        let id = id.into();
        self.limiters
            .read()
            .get(&id)
            .cloned()
            .ok_or(CooldownError::NotFound(id))
    }

    /// Force-evict every bucket of a shared limiter.
    pub fn reset_by_id(&self, id: impl Into<LimiterId>) -> Result<usize> {
        let limiter = self.get(id)?;
        Ok(limiter.reset())
    }

    pub fn contains(&self, id: impl Into<LimiterId>) -> bool {
        self.limiters.read().contains_key(&id.into())
    }

    /// Get the number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }

    pub fn ids(&self) -> Vec<LimiterId> {
        self.limiters.read().keys().cloned().collect()
    }
}

impl fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
