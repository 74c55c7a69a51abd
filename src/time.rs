use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch, as used by throttle timestamps.
pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

/// Small margin added to computed wait bounds so a waiter wakes just after,
/// rather than just before, the moment a throttle expires.
pub(crate) const TIMER_EPSILON: f64 = 0.01;
