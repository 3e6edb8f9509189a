// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

fn secs_since_start() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}

/// Lets an event through at most once per interval, across all threads.
///
/// Each aggregator owns its own limiter, so a noisy aggregator can't hide the warnings of another one.
/// Only whole seconds are tracked.
pub(crate) struct RateLimit {
    interval_secs: u64,
    // seconds since START at which the next event may pass
    next_allowed: AtomicU64,
}

impl RateLimit {
    #[track_caller]
    pub(crate) fn new(interval: Duration) -> Self {
        assert!(
            interval >= Duration::from_secs(1),
            "rate limit interval must be at least a second"
        );
        Self {
            interval_secs: interval.as_secs(),
            next_allowed: AtomicU64::new(0),
        }
    }

    /// Whether the caller may emit its event now. At most one caller per interval gets `true`.
    pub(crate) fn allow(&self) -> bool {
        let now = secs_since_start();
        let next = self.next_allowed.load(Ordering::Relaxed);
        next <= now
            && self
                .next_allowed
                .compare_exchange(
                    next,
                    now.saturating_add(self.interval_secs),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert2::check;

    use super::*;

    #[test]
    fn allows_once_per_interval() {
        let limit = RateLimit::new(Duration::from_secs(3600));
        check!(limit.allow());
        check!((0..1000).all(|_| !limit.allow()));
    }

    #[test]
    fn limiters_are_independent() {
        let first = RateLimit::new(Duration::from_secs(3600));
        let second = RateLimit::new(Duration::from_secs(3600));
        check!(first.allow());
        check!(second.allow());
        check!(!first.allow());
    }

    #[test]
    fn one_winner_across_threads() {
        let limit = RateLimit::new(Duration::from_secs(3600));
        let allowed: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| (0..100).filter(|_| limit.allow()).count()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        check!(allowed == 1);
    }

    #[test]
    #[should_panic = "rate limit interval must be at least a second"]
    fn rejects_sub_second_intervals() {
        RateLimit::new(Duration::from_millis(500));
    }
}
