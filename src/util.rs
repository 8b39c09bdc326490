use std::any::Any;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Extract a readable reason from a panic payload.
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: unknown cause".to_string()
    }
}

/// Convert a standard duration into a chrono duration, saturating on
/// overflow.
pub(crate) fn delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Add a standard duration to a timestamp, saturating on overflow.
pub(crate) fn add(timestamp: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    timestamp
        .checked_add_signed(delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The multiplicative retry delay for the given attempt, clamped to
/// `[min, max]`.
pub(crate) fn backoff(min: Duration, max: Duration, factor: f64, attempt: u32) -> Duration {
    let factor = factor.max(1.0);
    let max = max.max(min);

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay = min.as_secs_f64() * factor.powi(exponent);
    if !delay.is_finite() {
        return max;
    }

    Duration::try_from_secs_f64(delay)
        .unwrap_or(max)
        .clamp(min, max)
}

/// A duration with a uniform random jitter in `[0, jitter)` applied.
pub(crate) fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }

    let jitter_nanos = u64::try_from(jitter.as_nanos()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..jitter_nanos);
    base + Duration::from_nanos(random_jitter)
}
