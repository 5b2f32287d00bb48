//! Bucket cache owned by one limiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::key::BucketKey;
use super::scheduler::Scheduler;
use super::window::AdmissionWindow;

/// Default delay between background eviction sweeps.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(250);

/// Maps bucket keys to their admission windows.
///
/// Windows are created lazily and evicted once they have no outstanding
/// calls. An unforced eviction never drops a window that still tracks
/// admitted calls.
pub struct LimiterCache {
    windows: DashMap<BucketKey, Arc<AdmissionWindow>>,
    clean_interval: Duration,
    sweeper_started: AtomicBool,
}

impl LimiterCache {
    pub fn new(clean_interval: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            clean_interval,
            sweeper_started: AtomicBool::new(false),
        }
    }

    /// Get the window for `key`, creating it with `create` on a miss.
    ///
    /// Creation happens under the map's entry lock, so concurrent callers
    /// with the same key always end up sharing a single window.
    pub fn get_or_create<F>(&self, key: BucketKey, create: F) -> Arc<AdmissionWindow>
    where
        F: FnOnce() -> AdmissionWindow,
    {
        self.with_window(key, create, Arc::clone)
    }

    /// Run `f` on the window for `key` while holding its map entry.
    ///
    /// A sweep cannot remove the window until `f` returns, so state changes
    /// made by `f` always land on the window that stays in the cache.
    pub fn with_window<F, G, R>(&self, key: BucketKey, create: F, f: G) -> R
    where
        F: FnOnce() -> AdmissionWindow,
        G: FnOnce(&Arc<AdmissionWindow>) -> R,
    {
        let entry = match self.windows.entry(key) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                let window = create();
                debug!(
                    key = %entry.key(),
                    limit = window.limit(),
                    policy = ?window.policy(),
                    "Creating new admission window"
                );
                entry.insert(Arc::new(window))
            }
        };
        f(entry.value())
    }

    /// Look up a window without creating one.
    pub fn lookup(&self, key: &BucketKey) -> Option<Arc<AdmissionWindow>> {
        self.windows.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Evict one bucket, or every bucket when `key` is `None`.
    ///
    /// Windows with outstanding calls are kept unless `force` is set.
    /// Returns the number of windows removed.
    pub fn evict(&self, key: Option<&BucketKey>, force: bool) -> usize {
        match key {
            Some(key) => self
                .windows
                .remove_if(key, |_, window| force || !window.has_outstanding())
                .map_or(0, |_| 1),
            None => {
                let mut removed = 0;
                self.windows.retain(|_, window| {
                    let keep = !force && window.has_outstanding();
                    if !keep {
                        removed += 1;
                    }
                    keep
                });
                removed
            }
        }
    }

    /// Start the periodic unforced sweep.
    ///
    /// Only the first call starts a task; later calls return `false`.
    /// The task stops once the cache has been dropped.
    pub fn start_sweeper(self: &Arc<Self>, scheduler: &dyn Scheduler) -> bool {
        if self
            .sweeper_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let cache = Arc::downgrade(self);
        scheduler.every(
            self.clean_interval,
            Box::new(move || match cache.upgrade() {
                Some(cache) => {
                    let removed = cache.evict(None, false);
                    debug!(
                        removed = removed,
                        remaining = cache.len(),
                        "Swept idle admission windows"
                    );
                    true
                }
                None => false,
            }),
        );

        debug!(interval = ?self.clean_interval, "Started eviction sweeper");
        true
    }

    pub fn sweeper_started(&self) -> bool {
        self.sweeper_started.load(Ordering::Acquire)
    }

    pub fn clean_interval(&self) -> Duration {
        self.clean_interval
    }

    /// Get the number of cached windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Copy out every key and window.
    pub fn entries(&self) -> Vec<(BucketKey, Arc<AdmissionWindow>)> {
        self.windows
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Replace the whole cache content.
    pub fn replace_all(&self, windows: Vec<(BucketKey, Arc<AdmissionWindow>)>) {
        self.windows.clear();
        for (key, window) in windows {
            self.windows.insert(key, window);
        }
    }
}

impl std::fmt::Debug for LimiterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterCache")
            .field("windows", &self.windows.len())
            .field("clean_interval", &self.clean_interval)
            .field("sweeper_started", &self.sweeper_started())
            .finish()
    }
}
