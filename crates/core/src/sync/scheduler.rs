//! Core scheduler constants/helpers for scheduled reconciliation.

use std::time::Duration;

use rand::Rng;

/// Default cadence of the scheduled driver in seconds.
pub const SCHEDULED_SYNC_INTERVAL_SECS: u64 = 5 * 60;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SCHEDULED_SYNC_INTERVAL_JITTER_SECS: u64 = 15;

/// Delay before the first scheduled run after startup.
pub const SCHEDULED_SYNC_STARTUP_DELAY_SECS: u64 = 10;

/// Interval plus up to `SCHEDULED_SYNC_INTERVAL_JITTER_SECS` of random jitter.
pub fn next_cycle_delay(interval: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=SCHEDULED_SYNC_INTERVAL_JITTER_SECS);
    interval + Duration::from_secs(jitter)
}
