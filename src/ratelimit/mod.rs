//! Admission control: bucket keys, admission windows, and limiters.

mod cache;
mod call_site;
mod check;
mod clock;
mod key;
mod limiter;
mod persistence;
mod policy;
mod registry;
mod scheduler;
mod strategy;
mod trigger;
mod window;

pub use cache::{LimiterCache, DEFAULT_CLEAN_INTERVAL};
pub use call_site::CallSite;
pub use check::{AdmissionCheck, AlwaysApply, AsyncFnCheck, FnCheck};
pub use clock::{Clock, SystemClock, MAX_CLOCK_LAG};
pub use key::{ArgValue, BucketKey, CallArgs};
pub use limiter::{Limiter, LimiterBuilder};
pub use persistence::{restore, snapshot, BucketState, LimiterState, STATE_VERSION};
pub use policy::{DailyResetTimes, ResetPolicy, TimeWindow};
pub use registry::{LimiterId, SharedRegistry};
pub use scheduler::{Callback, Scheduler, Tick, TokioScheduler};
pub use strategy::{BucketStrategy, KeyExtractor};
pub use trigger::TriggerLimiter;
pub use window::AdmissionWindow;
