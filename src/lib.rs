//! Cooldowns - call admission control per argument bucket
//!
//! This crate decides whether a call may proceed based on how many calls
//! its bucket has been admitted recently. Each bucket admits a fixed number
//! of calls; every admitted call consumes one unit of capacity that comes
//! back after a fixed period or at the next configured time of day.

pub mod config;
pub mod error;
pub mod ratelimit;
