//! Per-bucket admission window.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;

use super::clock::Clock;
use super::policy::ResetPolicy;
use super::scheduler::Scheduler;
use crate::error::{CooldownError, Result};

#[derive(Debug)]
struct WindowState {
    current_available: u32,
    /// One entry per outstanding admitted call, oldest first
    pending_resets: VecDeque<DateTime<Utc>>,
}

/// Tracks the remaining capacity of one bucket.
///
/// Every admission consumes one unit of capacity and schedules its
/// replenishment. Completing the guarded call gives nothing back;
/// capacity returns only when the replenishment fires.
///
/// A pending replenishment keeps its window alive until it has fired.
pub struct AdmissionWindow {
    limit: u32,
    policy: ResetPolicy,
    state: Mutex<WindowState>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
}

impl AdmissionWindow {
    /// Create a fully available window.
    pub fn new(
        limit: u32,
        policy: ResetPolicy,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            limit,
            policy,
            state: Mutex::new(WindowState {
                current_available: limit,
                pending_resets: VecDeque::new(),
            }),
            clock,
            scheduler,
        }
    }

    /// Rebuild a window from persisted values.
    ///
    /// Replenishments that are already due are applied immediately instead
    /// of being scheduled. Capacity never exceeds `limit`.
    pub fn restore(
        limit: u32,
        policy: ResetPolicy,
        current_available: u32,
        pending_resets: &[DateTime<Utc>],
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let window = Arc::new(Self::new(limit, policy, clock, scheduler));
        let now = window.clock.now();
        {
            let mut state = window.state.lock();
            state.current_available = current_available.min(limit);

            for resets_at in pending_resets.iter().copied() {
                if resets_at <= now {
                    state.current_available = (state.current_available + 1).min(limit);
                    continue;
                }

                let delay = (resets_at - now).to_std().unwrap_or_default();
                window.schedule_replenish(delay);
                state.pending_resets.push_back(resets_at);
            }
        }
        window
    }

    /// Try to consume one unit of capacity.
    ///
    /// Returns the time at which the consumed unit is replenished, or
    /// [`CooldownError::OnCooldown`] if the window is exhausted.
    pub fn admit(self: &Arc<Self>) -> Result<DateTime<Utc>> {
        let mut state = self.state.lock();
        let now = self.clock.now();

        if state.current_available == 0 {
            let resets_at = state.pending_resets.front().copied().unwrap_or(now);
            return Err(CooldownError::OnCooldown {
                retry_after: (resets_at - now).to_std().unwrap_or_default(),
                resets_at,
            });
        }

        let resets_at = self.policy.next_reset(now);
        let delay = (resets_at - now).to_std().unwrap_or_default();
        self.schedule_replenish(delay);

        state.current_available -= 1;
        state.pending_resets.push_back(resets_at);

        trace!(
            remaining = state.current_available,
            resets_at = %resets_at,
            "Admitted call"
        );

        Ok(resets_at)
    }

    fn schedule_replenish(self: &Arc<Self>, delay: std::time::Duration) {
        let window = Arc::clone(self);
        self.scheduler
            .schedule(delay, Box::new(move || window.replenish()));
    }

    /// Give back one unit of capacity.
    ///
    /// Stale or duplicate firings are ignored once the window is full.
    fn replenish(&self) {
        let mut state = self.state.lock();
        if state.current_available >= self.limit {
            trace!(limit = self.limit, "Ignoring replenishment for a full window");
            return;
        }

        state.current_available += 1;
        state.pending_resets.pop_front();

        trace!(remaining = state.current_available, "Replenished one call");
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn policy(&self) -> &ResetPolicy {
        &self.policy
    }

    /// Calls that can still be admitted right now.
    pub fn current_available(&self) -> u32 {
        self.state.lock().current_available
    }

    /// The earliest pending replenishment, if any.
    pub fn next_reset(&self) -> Option<DateTime<Utc>> {
        self.state.lock().pending_resets.front().copied()
    }

    /// The latest pending replenishment, after which the window is idle.
    pub fn fully_reset_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().pending_resets.back().copied()
    }

    /// Whether any admitted call is still waiting to be replenished.
    pub fn has_outstanding(&self) -> bool {
        self.state.lock().current_available != self.limit
    }

    /// All pending replenishments, oldest first.
    pub fn pending_resets(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().pending_resets.iter().copied().collect()
    }

    /// Capacity and pending replenishments read under one lock.
    pub(crate) fn state_snapshot(&self) -> (u32, Vec<DateTime<Utc>>) {
        let state = self.state.lock();
        (
            state.current_available,
            state.pending_resets.iter().copied().collect(),
        )
    }
}

impl std::fmt::Debug for AdmissionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionWindow")
            .field("limit", &self.limit)
            .field("policy", &self.policy)
            .field("current_available", &state.current_available)
            .field("pending_resets", &state.pending_resets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::SystemClock;
    use crate::ratelimit::policy::DailyResetTimes;
    use crate::ratelimit::scheduler::TokioScheduler;
    use chrono::{NaiveTime, TimeZone};
    use std::time::Duration;
    use tokio::time::sleep;

    fn window(limit: u32, policy: ResetPolicy, clock: Arc<dyn Clock>) -> Arc<AdmissionWindow> {
        let scheduler = Arc::new(TokioScheduler::try_current().unwrap());
        Arc::new(AdmissionWindow::new(limit, policy, clock, scheduler))
    }

    fn periodic(limit: u32, secs: u64) -> Arc<AdmissionWindow> {
        window(
            limit,
            ResetPolicy::every(Duration::from_secs(secs)),
            Arc::new(SystemClock::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_until_exhausted() {
        let window = periodic(3, 10);

        for expected in [2, 1, 0] {
            window.admit().unwrap();
            assert_eq!(window.current_available(), expected);
        }
        assert_eq!(window.pending_resets().len(), 3);

        let err = window.admit().unwrap_err();
        assert!(err.is_on_cooldown());
        assert_eq!(window.current_available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_cooldown_reports_earliest_reset() {
        let window = periodic(1, 1);

        let resets_at = window.admit().unwrap();
        sleep(Duration::from_millis(250)).await;

        match window.admit() {
            Err(CooldownError::OnCooldown {
                retry_after,
                resets_at: reported,
            }) => {
                assert_eq!(reported, resets_at);
                assert_eq!(retry_after, Duration::from_millis(750));
            }
            other => panic!("expected OnCooldown, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replenishes_after_period() {
        let window = periodic(1, 1);

        window.admit().unwrap();
        assert!(window.admit().is_err());

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(window.current_available(), 1);
        assert!(!window.has_outstanding());
        assert!(window.admit().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_reset_and_fully_reset_at() {
        let window = periodic(2, 10);
        assert_eq!(window.next_reset(), None);
        assert_eq!(window.fully_reset_at(), None);

        let first = window.admit().unwrap();
        sleep(Duration::from_secs(1)).await;
        let second = window.admit().unwrap();

        assert_eq!(window.next_reset(), Some(first));
        assert_eq!(window.fully_reset_at(), Some(second));
        // peeking does not consume
        assert_eq!(window.next_reset(), Some(first));

        sleep(Duration::from_millis(9500)).await;
        assert_eq!(window.next_reset(), Some(second));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(window.next_reset(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_replenish_does_not_exceed_limit() {
        let window = periodic(2, 10);
        window.admit().unwrap();

        window.replenish();
        window.replenish();
        window.replenish();

        assert_eq!(window.current_available(), 2);
        assert!(window.pending_resets().is_empty());

        // The original timer still fires and must be ignored
        sleep(Duration::from_secs(11)).await;
        assert_eq!(window.current_available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_window_shares_reset_time() {
        let start = Utc.with_ymd_and_hms(2023, 2, 14, 3, 30, 0).unwrap();
        let reset = NaiveTime::from_hms_opt(3, 30, 1).unwrap();
        let policy = ResetPolicy::Daily(DailyResetTimes::new(vec![reset]).unwrap());
        let window = window(2, policy, Arc::new(SystemClock::starting_at(start)));

        let first = window.admit().unwrap();
        sleep(Duration::from_millis(100)).await;
        let second = window.admit().unwrap();

        let expected = Utc.with_ymd_and_hms(2023, 2, 14, 3, 30, 1).unwrap();
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(window.fully_reset_at(), Some(expected));

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(window.current_available(), 2);
        assert_eq!(window.next_reset(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_applies_due_resets() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let scheduler = Arc::new(TokioScheduler::try_current().unwrap());
        let now = clock.now();
        let past = now - chrono::Duration::seconds(5);
        let future = now + chrono::Duration::seconds(5);

        let window = AdmissionWindow::restore(
            3,
            ResetPolicy::every(Duration::from_secs(10)),
            1,
            &[past, future],
            clock,
            scheduler,
        );

        assert_eq!(window.current_available(), 2);
        assert_eq!(window.pending_resets(), vec![future]);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(window.current_available(), 3);
        assert!(window.pending_resets().is_empty());
    }
}
