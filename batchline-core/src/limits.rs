// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Size and time limits of an accumulation cycle.

use std::time::Duration;

/// Bounds on a single batch. A cycle ends when either limit is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    max_batch_size: usize,
    max_wait_time: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
            max_wait_time: Self::DEFAULT_MAX_WAIT_TIME,
        }
    }
}

impl BatchLimits {
    /// Default for [`BatchLimits::max_batch_size`].
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
    /// Default for [`BatchLimits::max_wait_time`].
    pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_secs(1);

    /// Create new limits.
    ///
    /// # Panics
    /// If `max_batch_size` or `max_wait_time` is zero.
    #[track_caller]
    pub fn new(max_batch_size: usize, max_wait_time: Duration) -> Self {
        Self::default()
            .with_max_batch_size(max_batch_size)
            .with_max_wait_time(max_wait_time)
    }

    /// Maximum number of items folded into one batch.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Maximum time a cycle keeps accumulating, measured from its start.
    pub fn max_wait_time(&self) -> Duration {
        self.max_wait_time
    }

    /// Replace the batch size.
    ///
    /// # Panics
    /// If `max_batch_size` is zero.
    #[track_caller]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        assert!(max_batch_size > 0, "max_batch_size must not be zero");
        self.max_batch_size = max_batch_size;
        self
    }

    /// Replace the wait time.
    ///
    /// # Panics
    /// If `max_wait_time` is zero.
    #[track_caller]
    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        assert!(
            max_wait_time > Duration::ZERO,
            "max_wait_time must not be zero"
        );
        self.max_wait_time = max_wait_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn defaults() {
        let limits = BatchLimits::default();
        check!(limits.max_batch_size() == 1000);
        check!(limits.max_wait_time() == Duration::from_secs(1));
    }

    #[test]
    #[should_panic = "max_batch_size must not be zero"]
    fn rejects_zero_batch_size() {
        BatchLimits::new(0, Duration::from_secs(1));
    }

    #[test]
    #[should_panic = "max_wait_time must not be zero"]
    fn rejects_zero_wait_time() {
        BatchLimits::new(10, Duration::ZERO);
    }
}
