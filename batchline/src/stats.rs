// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of what the workers of an [`Aggregator`](crate::Aggregator) have done so far.
///
/// The counters only grow. They are maintained by the worker thread, so a snapshot taken while a
/// worker is running may be slightly behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Items successfully folded into a batch by [`Batcher::process`](crate::Batcher::process).
    pub items_processed: u64,
    /// Batches successfully committed by [`Batcher::finish`](crate::Batcher::finish).
    pub batches_finished: u64,
    /// Items dropped because processing them failed or panicked.
    pub items_poisoned: u64,
    /// Worker threads that ended because of an error rather than a drain.
    pub crashes: u64,
    /// Worker threads started.
    pub workers_started: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    items_processed: AtomicU64,
    batches_finished: AtomicU64,
    items_poisoned: AtomicU64,
    crashes: AtomicU64,
    workers_started: AtomicU64,
}

impl Counters {
    pub(crate) fn item_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_finished(&self) {
        self.batches_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_poisoned(&self) {
        self.items_poisoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn crashed(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the id of the new worker generation.
    pub(crate) fn worker_started(&self) -> u64 {
        self.workers_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn snapshot(&self) -> AggregatorStats {
        AggregatorStats {
            items_processed: self.items_processed.load(Ordering::Relaxed),
            batches_finished: self.batches_finished.load(Ordering::Relaxed),
            items_poisoned: self.items_poisoned.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
        }
    }
}
