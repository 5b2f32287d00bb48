//! Deferred callbacks hosted on an async runtime.

use std::fmt::Debug;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::{CooldownError, Result};

/// A one-shot callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A repeating callback; returning `false` stops the repetition.
pub type Tick = Box<dyn FnMut() -> bool + Send + 'static>;

/// Capability to run callbacks later.
///
/// Scheduled callbacks cannot be cancelled individually.
pub trait Scheduler: Send + Sync + Debug {
    /// Run `callback` once after `delay`.
    fn schedule(&self, delay: Duration, callback: Callback);

    /// Run `tick` every `interval`, starting one interval from now.
    fn every(&self, interval: Duration, tick: Tick);
}

/// Scheduler spawning timer tasks on a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Capture the runtime the caller is running on.
    pub fn try_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CooldownError::Runtime(e.to_string()))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, callback: Callback) {
        let deadline = Instant::now() + delay;
        self.handle.spawn(async move {
            time::sleep_until(deadline).await;
            callback();
        });
    }

    fn every(&self, interval: Duration, mut tick: Tick) {
        // tokio intervals reject a zero period
        let interval = interval.max(Duration::from_millis(1));
        self.handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick() {
                    break;
                }
            }
        });
    }
}
