//! Host time primitives: the wall clock and the alarm used to wake idle
//! instances when their next wake-queue entry comes due.

use chrono::Utc;

/// Source of the current time in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Host primitive that re-enters an idle instance at a given time.
///
/// Only the most recent alarm per instance matters; setting a new one
/// replaces the previous.
pub trait AlarmScheduler: Send + Sync {
    fn set_alarm(&self, instance_id: &str, at_ms: i64);
}
