//! Sliding-window dispatch limiter.
//!
//! Admits at most `max` dispatches within any rolling `duration`. One limiter
//! belongs to one queue; all of that queue's workers go through it.

use std::collections::VecDeque;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::LimiterConfig;

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,

    /// Try again once `retry_after` has elapsed
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

pub struct RateLimiter {
    max: usize,
    duration: Duration,
    /// Grant instants inside the current window, oldest first
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            max: config.max.max(1) as usize,
            duration: config.duration,
            grants: Mutex::new(VecDeque::with_capacity(config.max as usize)),
        }
    }

    /// Request one dispatch slot
    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> Admission {
        let mut grants = self.grants.lock();

        while let Some(oldest) = grants.front() {
            if now.duration_since(*oldest) >= self.duration {
                grants.pop_front();
            } else {
                break;
            }
        }

        if grants.len() < self.max {
            grants.push_back(now);
            return Admission::Granted;
        }

        // Full window: the oldest grant decides when a slot frees up
        let retry_after = grants
            .front()
            .map(|oldest| self.duration.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.duration);

        Admission::Denied { retry_after }
    }

    /// Hand back the most recent grant when the dispatch it admitted did not
    /// happen (the claim lost a race)
    pub fn refund(&self) {
        self.grants.lock().pop_back();
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(max: u32, millis: u64) -> RateLimiter {
        RateLimiter::new(LimiterConfig::new(max, Duration::from_millis(millis)))
    }

    #[test]
    fn one_per_window() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();

        assert!(limiter.try_acquire_at(start).is_granted());
        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_millis(400)),
            Admission::Denied { retry_after: Duration::from_millis(600) }
        );
        assert!(limiter.try_acquire_at(start + Duration::from_millis(1000)).is_granted());
    }

    #[test]
    fn refund_releases_the_slot() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();

        assert!(limiter.try_acquire_at(start).is_granted());
        limiter.refund();
        assert!(limiter.try_acquire_at(start + Duration::from_millis(1)).is_granted());
    }

    #[test]
    fn concurrent_acquires_never_over_admit() {
        let limiter = std::sync::Arc::new(limiter(5, 60_000));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10).filter(|_| limiter.try_acquire().is_granted()).count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 5);
    }

    proptest! {
        #[test]
        fn any_window_holds_at_most_max(
            max in 1u32..5,
            window in 10u64..200,
            offsets in proptest::collection::vec(0u64..2000, 1..60),
        ) {
            let limiter = limiter(max, window);
            let start = Instant::now();
            let mut offsets = offsets;
            offsets.sort_unstable();

            let granted: Vec<u64> = offsets
                .into_iter()
                .filter(|ms| {
                    limiter
                        .try_acquire_at(start + Duration::from_millis(*ms))
                        .is_granted()
                })
                .collect();

            for (i, first) in granted.iter().enumerate() {
                let in_window = granted[i..].iter().take_while(|ms| **ms < first + window).count();
                prop_assert!(in_window <= max as usize);
            }
        }
    }
}
