/// Monotonic time source, milliseconds since boot.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Seconds between two monotonic timestamps, clamped to `max_dt_ms`.
///
/// Returns `None` when the interval is zero or the timestamps run backwards,
/// those samples must be skipped rather than integrated.
pub fn clamped_dt_s(previous_ms: u64, now_ms: u64, max_dt_ms: u32) -> Option<f64> {
    if now_ms <= previous_ms {
        return None;
    }
    let dt_ms = (now_ms - previous_ms).min(max_dt_ms as u64);
    Some(dt_ms as f64 / 1000.0)
}

/// Milliseconds elapsed since `since_ms`, zero if the clock is behind it.
pub fn elapsed_ms(now_ms: u64, since_ms: u64) -> u64 {
    now_ms.saturating_sub(since_ms)
}
