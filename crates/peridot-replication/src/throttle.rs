//! Replication queue throttle with hysteresis.
//!
//! The throttle signals the application to slow writes when the replication
//! queue crosses the high watermark in either operation count or byte size.
//! It clears only after both measures have stayed below the low watermark
//! for one full measurement interval, so a queue oscillating around the
//! boundary does not flap the callback.

use std::sync::Mutex;
use std::time::Duration;

use peridot_types::Timestamp;

/// Callback invoked on throttle transitions: `true` engages, `false` clears.
pub type ThrottleCallback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Default)]
struct ThrottleState {
    engaged: bool,

    /// When both measures first dropped below the low watermark.
    below_low_since: Option<Timestamp>,
}

/// Queue throttle with high/low watermark hysteresis.
pub struct ReplicationThrottle {
    operation_high: usize,
    bytes_high: u64,
    operation_low: usize,
    bytes_low: u64,
    measurement_interval: Duration,

    state: Mutex<ThrottleState>,
    callback: Mutex<Option<ThrottleCallback>>,
}

impl ReplicationThrottle {
    /// Creates a throttle. Low watermarks are half the high watermarks.
    pub fn new(operation_high: usize, bytes_high: u64, measurement_interval: Duration) -> Self {
        Self {
            operation_high,
            bytes_high,
            operation_low: operation_high / 2,
            bytes_low: bytes_high / 2,
            measurement_interval,
            state: Mutex::new(ThrottleState::default()),
            callback: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: ThrottleCallback) {
        *self
            .callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    pub fn is_engaged(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .engaged
    }

    /// Feeds a queue measurement. Returns the transition, if any.
    pub fn observe(&self, queue_depth: usize, queue_bytes: u64, now: Timestamp) -> Option<bool> {
        let transition = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if !state.engaged {
                if queue_depth >= self.operation_high || queue_bytes >= self.bytes_high {
                    state.engaged = true;
                    state.below_low_since = None;
                    Some(true)
                } else {
                    None
                }
            } else if queue_depth < self.operation_low && queue_bytes < self.bytes_low {
                match state.below_low_since {
                    None => {
                        state.below_low_since = Some(now);
                        None
                    }
                    Some(since) if now.duration_since(since) >= self.measurement_interval => {
                        state.engaged = false;
                        state.below_low_since = None;
                        Some(false)
                    }
                    Some(_) => None,
                }
            } else {
                // Back above the low watermark: the quiet interval restarts.
                state.below_low_since = None;
                None
            }
        };

        if let Some(engaged) = transition {
            if let Some(cb) = self
                .callback
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .as_ref()
            {
                cb(engaged);
            }
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> ReplicationThrottle {
        ReplicationThrottle::new(100, 1000, Duration::from_millis(10))
    }

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_nanos(ms * 1_000_000)
    }

    #[test]
    fn engages_on_either_watermark() {
        let t = throttle();
        assert_eq!(t.observe(100, 0, at(0)), Some(true));

        let t = throttle();
        assert_eq!(t.observe(0, 1000, at(0)), Some(true));
    }

    #[test]
    fn clears_only_after_quiet_interval() {
        let t = throttle();
        assert_eq!(t.observe(100, 2000, at(0)), Some(true));

        // Below low watermark, but the quiet interval has not elapsed.
        assert_eq!(t.observe(10, 10, at(1)), None);
        assert_eq!(t.observe(10, 10, at(5)), None);

        // Interval elapsed with both measures low.
        assert_eq!(t.observe(10, 10, at(12)), Some(false));
        assert!(!t.is_engaged());
    }

    #[test]
    fn bounce_above_low_watermark_restarts_the_interval() {
        let t = throttle();
        t.observe(100, 2000, at(0));

        assert_eq!(t.observe(10, 10, at(1)), None);
        // One measure pops back above the low watermark.
        assert_eq!(t.observe(60, 10, at(5)), None);
        // Quiet time restarts from here.
        assert_eq!(t.observe(10, 10, at(6)), None);
        assert_eq!(t.observe(10, 10, at(14)), None);
        assert_eq!(t.observe(10, 10, at(17)), Some(false));
    }

    #[test]
    fn between_watermarks_neither_engages_nor_clears() {
        let t = throttle();
        t.observe(100, 2000, at(0));
        // Between low (50) and high (100).
        assert_eq!(t.observe(75, 10, at(20)), None);
        assert!(t.is_engaged());
    }

    #[test]
    fn callback_sees_transitions() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicI32, Ordering};

        let t = throttle();
        let hits = Arc::new(AtomicI32::new(0));
        let hits_cb = hits.clone();
        t.set_callback(Box::new(move |engaged| {
            hits_cb.fetch_add(if engaged { 1 } else { -1 }, Ordering::SeqCst);
        }));

        t.observe(200, 0, at(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        t.observe(0, 0, at(1));
        t.observe(0, 0, at(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
