// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    any::type_name,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use batchline_core::{BatchLimits, Batcher};
use derive_where::derive_where;

use crate::{
    stats::{AggregatorStats, Counters},
    rate_limit::RateLimit,
    worker::{self, Generation, Limits, SKIP_WARNING_INTERVAL, Shared},
};

/// Builder for [`Aggregator`]
#[derive(Clone, Debug)]
pub struct AggregatorBuilder {
    limits: BatchLimits,
    poll_interval: Duration,
    thread_name: String,
    name: Option<String>,
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self {
            limits: BatchLimits::default(),
            poll_interval: Duration::from_millis(100),
            thread_name: "batchline-worker".into(),
            name: None,
        }
    }
}

impl AggregatorBuilder {
    /// Create a builder with the default limits, a 100 millisecond poll interval and no name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of items folded into one batch.
    ///
    /// Defaults to 1000. Can be changed later with [`Aggregator::set_max_batch_size`].
    #[track_caller]
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.limits = self.limits.with_max_batch_size(max_batch_size);
        self
    }

    /// Sets how long an accumulation cycle keeps waiting for more items before the batch is finished.
    ///
    /// Defaults to 1 second. Can be changed later with [`Aggregator::set_max_wait_time`].
    ///
    /// The time is measured from the start of the cycle, so a trickle of items is committed at least this
    /// often. A short wait time produces more, smaller batches.
    #[track_caller]
    pub fn max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.limits = self.limits.with_max_wait_time(max_wait_time);
        self
    }

    /// Sets both batch limits at once.
    pub fn limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets how long the worker parks when the queue is empty before it re-checks the queue, the
    /// drain flag and the cycle deadline.
    ///
    /// Defaults to 100 milliseconds. Pushes and drain requests wake the worker up early, so this mostly
    /// bounds how stale a missed wakeup can get.
    #[track_caller]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        assert!(
            poll_interval > Duration::ZERO,
            "poll_interval must not be zero"
        );
        self.poll_interval = poll_interval;
        self
    }

    /// Thread name assigned to every worker thread.
    #[track_caller]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.thread_name = name;
        self
    }

    /// Tag attached to every log event of this aggregator. Defaults to the type name of the [`Batcher`].
    #[track_caller]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.name = Some(name);
        self
    }

    // pub so it can be accessed through the `global_aggregator!` macro
    #[doc(hidden)]
    pub fn name_if_unset(mut self, name: &str) -> Self {
        self.name.get_or_insert_with(|| name.to_owned());
        self
    }

    /// Build an [`Aggregator`] that hands batches to `batcher`.
    ///
    /// No thread is started until the first item is pushed. Returns both the aggregator and an
    /// [`AggregatorJoinHandle`] that drains the queue and stops the worker when dropped, so that no
    /// items are lost during shutdown.
    pub fn build<B: Batcher>(self, batcher: B) -> (Aggregator<B>, AggregatorJoinHandle<B>) {
        let shared = Shared {
            batcher,
            queue: Default::default(),
            limits: Limits::new(self.limits),
            poll_interval: self.poll_interval,
            name: self.name.unwrap_or_else(|| type_name::<B>().into()),
            counters: Counters::default(),
            skip_warnings: RateLimit::new(SKIP_WARNING_INTERVAL),
        };
        let aggregator = Aggregator(Arc::new(Inner {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
            thread_name: self.thread_name,
        }));
        let handle = AggregatorJoinHandle {
            aggregator: Some(aggregator.clone()),
        };
        (aggregator, handle)
    }
}

/// Collects pushed items on a background worker thread and hands them to a [`Batcher`] in batches.
///
/// Cloning is cheap and still pushes into the same queue, served by the same worker.
///
/// At most one worker thread is alive per aggregator. It is started by [`Aggregator::push`] (or
/// [`Aggregator::drain`]) and runs accumulation cycles: each cycle pops items and folds them into a
/// batch until [`BatchLimits::max_batch_size`] items were processed or
/// [`BatchLimits::max_wait_time`] passed, then hands the batch to [`Batcher::finish`]. The worker
/// stops when drained, or when a cycle fails; in the latter case the next `push` or `drain` starts a
/// new worker that continues with the remaining queue.
#[derive_where(Clone)]
pub struct Aggregator<B: Batcher>(Arc<Inner<B>>);

struct Inner<B: Batcher> {
    shared: Arc<Shared<B>>,
    // Only held around start, drain-flag transitions and slot cleanup, never while joining
    worker: Mutex<Option<Worker>>,
    thread_name: String,
}

struct Worker {
    handle: thread::JoinHandle<()>,
    generation: Arc<Generation>,
}

impl Worker {
    fn is_running(&self) -> bool {
        !self.generation.is_finished()
    }
}

impl<B: Batcher> fmt::Debug for Aggregator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("name", &self.0.shared.name)
            .field("queue_len", &self.queue_len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<B: Batcher> Aggregator<B> {
    /// Create a new aggregator using the [`AggregatorBuilder`] defaults.
    pub fn new(batcher: B) -> (Self, AggregatorJoinHandle<B>) {
        AggregatorBuilder::new().build(batcher)
    }

    /// Queue `item` and make sure a worker is running. Never blocks on the worker and never fails.
    pub fn push(&self, item: B::Item) {
        self.0.shared.queue.push(item);
        if !self.is_running() {
            self.start();
        }
    }

    /// Start a worker thread unless one is already running. Returns whether a thread was started.
    ///
    /// Calling this directly is rarely needed: [`Aggregator::push`] and [`Aggregator::drain`] start a
    /// worker on demand.
    pub fn start(&self) -> bool {
        let mut slot = self.lock_worker();
        if slot.as_ref().is_some_and(Worker::is_running) {
            return false;
        }
        if let Some(previous) = slot.take() {
            // already finished, this only reaps the thread
            let _ = previous.handle.join();
        }

        let generation = Arc::new(Generation::new(self.0.shared.counters.worker_started()));
        let shared = Arc::clone(&self.0.shared);
        let worker_generation = Arc::clone(&generation);
        let spawned = thread::Builder::new()
            .name(self.0.thread_name.clone())
            .spawn(move || worker::run(&shared, &worker_generation));
        match spawned {
            Ok(handle) => {
                tracing::info!(
                    aggregator = %self.0.shared.name,
                    generation = generation.id(),
                    queue_len = self.queue_len(),
                    "started worker thread"
                );
                *slot = Some(Worker { handle, generation });
                true
            }
            Err(err) => {
                tracing::error!(
                    aggregator = %self.0.shared.name,
                    ?err,
                    "couldn't spawn worker thread, items stay queued"
                );
                false
            }
        }
    }

    /// Whether a worker thread was started and has not terminated yet.
    pub fn is_running(&self) -> bool {
        self.lock_worker().as_ref().is_some_and(Worker::is_running)
    }

    /// Block until every queued item has been handed to the [`Batcher`] and the worker has stopped.
    ///
    /// If a worker is running, it is asked to drain: it finishes its current batch, keeps processing
    /// until it observes an empty queue (including items pushed while draining) and then stops. If no
    /// worker is running but items are queued, for example after a worker crashed, a fresh worker is
    /// started and drained. Draining an idle, empty aggregator does nothing.
    ///
    /// Always returns `true`. A drain that ended in a worker crash is not reported here; use
    /// [`Aggregator::stats`] or your own [`Batcher::finish`] bookkeeping to tell the cases apart. Note
    /// that a producer that keeps pushing faster than the worker can process can keep this call
    /// blocked.
    pub fn drain(&self) -> bool {
        loop {
            let draining = {
                let slot = self.lock_worker();
                match slot.as_ref() {
                    Some(worker) if worker.is_running() => {
                        // set even if the queue looks empty: the worker may be holding the last items
                        worker.generation.request_drain();
                        self.0.shared.queue.wake();
                        Some(Arc::clone(&worker.generation))
                    }
                    _ => None,
                }
            };

            match draining {
                Some(generation) => {
                    tracing::info!(
                        aggregator = %self.0.shared.name,
                        generation = generation.id(),
                        queue_len = self.queue_len(),
                        "joining worker thread"
                    );
                    generation.wait_finished();
                    self.reap(&generation);
                    tracing::info!(
                        aggregator = %self.0.shared.name,
                        generation = generation.id(),
                        queue_len = self.queue_len(),
                        "stopped worker thread"
                    );
                }
                None => {
                    if self.0.shared.queue.is_empty() {
                        return true;
                    }
                    if !self.start() && !self.is_running() {
                        tracing::warn!(
                            aggregator = %self.0.shared.name,
                            queue_len = self.queue_len(),
                            "no worker available to drain the queue"
                        );
                        return true;
                    }
                }
            }
        }
    }

    /// Drain the queue if a worker is running, otherwise do nothing.
    ///
    /// Meant to be called once during shutdown; dropping the [`AggregatorJoinHandle`] calls it for you.
    /// Returns whether a worker was running.
    pub fn stop(&self) -> bool {
        if self.is_running() {
            self.drain()
        } else {
            tracing::info!(
                aggregator = %self.0.shared.name,
                "worker thread not running - nothing to stop"
            );
            false
        }
    }

    /// The [`Batcher`] this aggregator hands batches to.
    pub fn batcher(&self) -> &B {
        &self.0.shared.batcher
    }

    /// The limits the next accumulation cycle will use.
    pub fn limits(&self) -> BatchLimits {
        self.0.shared.limits.load()
    }

    /// Change the batch size. Takes effect at the start of the next accumulation cycle.
    ///
    /// # Panics
    /// If `max_batch_size` is zero.
    #[track_caller]
    pub fn set_max_batch_size(&self, max_batch_size: usize) {
        let validated = BatchLimits::default().with_max_batch_size(max_batch_size);
        self.0
            .shared
            .limits
            .store_max_batch_size(validated.max_batch_size());
    }

    /// Change the wait time. Takes effect at the start of the next accumulation cycle.
    ///
    /// # Panics
    /// If `max_wait_time` is zero.
    #[track_caller]
    pub fn set_max_wait_time(&self, max_wait_time: Duration) {
        let validated = BatchLimits::default().with_max_wait_time(max_wait_time);
        self.0
            .shared
            .limits
            .store_max_wait_time(validated.max_wait_time());
    }

    /// The number of items waiting to be processed.
    pub fn queue_len(&self) -> usize {
        self.0.shared.queue.len()
    }

    /// Whether no items are waiting to be processed.
    pub fn is_queue_empty(&self) -> bool {
        self.0.shared.queue.is_empty()
    }

    /// Throw away every queued item without processing it, returning how many were removed.
    ///
    /// This is a maintenance operation, normal operation never needs it.
    pub fn clear_queue(&self) -> usize {
        let removed = self.0.shared.queue.clear();
        if removed > 0 {
            tracing::warn!(aggregator = %self.0.shared.name, removed, "cleared queue");
        }
        removed
    }

    /// Counters describing what the workers of this aggregator have done so far.
    pub fn stats(&self) -> AggregatorStats {
        self.0.shared.counters.snapshot()
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.0
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Clears the slot if it still belongs to `generation`; a concurrent push may already have started
    // the next one.
    fn reap(&self, generation: &Arc<Generation>) {
        let mut slot = self.lock_worker();
        if slot
            .as_ref()
            .is_some_and(|worker| Arc::ptr_eq(&worker.generation, generation))
        {
            if let Some(worker) = slot.take() {
                let _ = worker.handle.join();
            }
        }
    }
}

/// Guard handle that, when dropped, drains the queue and stops the worker of its [`Aggregator`].
///
/// This is the explicit replacement for a process-exit hook: keep it alive in `main` (or wherever your
/// service shuts down) so that items still queued at shutdown are handed to the [`Batcher`].
#[must_use = "if unused the aggregator will be stopped immediately"]
pub struct AggregatorJoinHandle<B: Batcher> {
    aggregator: Option<Aggregator<B>>,
}

impl<B: Batcher> AggregatorJoinHandle<B> {
    /// Drop the handle without stopping the aggregator. Queued items are only processed if something
    /// else calls [`Aggregator::stop`] or [`Aggregator::drain`] before the process exits.
    pub fn forget(mut self) {
        self.aggregator = None;
    }

    /// Alias for `drop(handle)`. Drains the queue and stops the worker.
    pub fn shut_down(self) {}
}

impl<B: Batcher> Drop for AggregatorJoinHandle<B> {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;
    use crate::test_util::CountingBatcher;

    #[test]
    fn does_not_start_until_pushed() {
        let (aggregator, _handle) = Aggregator::new(CountingBatcher::<u32>::new());
        check!(!aggregator.is_running());
        check!(aggregator.stats().workers_started == 0);
        aggregator.push(1);
        check!(aggregator.stats().workers_started == 1);
        aggregator.drain();
        check!(!aggregator.is_running());
    }

    #[test]
    fn start_is_idempotent() {
        let (aggregator, _handle) = Aggregator::new(CountingBatcher::<u32>::new());
        check!(aggregator.start());
        check!(!aggregator.start());
        check!(aggregator.is_running());
        check!(aggregator.drain());
        check!(aggregator.start());
        aggregator.drain();
        check!(aggregator.stats().workers_started == 2);
    }

    #[test]
    fn stop_without_worker_is_a_noop() {
        let (aggregator, handle) = Aggregator::new(CountingBatcher::<u32>::new());
        check!(!aggregator.stop());
        handle.forget();
    }

    #[test]
    fn runtime_limits_apply_to_later_cycles() {
        let (aggregator, _handle) = AggregatorBuilder::new()
            .max_batch_size(10)
            .max_wait_time(Duration::from_secs(60))
            .build(CountingBatcher::<u32>::new());
        aggregator.set_max_batch_size(5);
        check!(aggregator.limits().max_batch_size() == 5);
        for i in 0..20 {
            aggregator.push(i);
        }
        aggregator.drain();
        check!(aggregator.batcher().processed() == 20);
        check!(aggregator.batcher().batch_sizes().iter().all(|size| *size <= 5));
    }

    #[test]
    fn concurrent_limit_setters_keep_both_changes() {
        for _ in 0..50 {
            let (aggregator, _handle) = AggregatorBuilder::new()
                .max_batch_size(10)
                .max_wait_time(Duration::from_secs(1))
                .build(CountingBatcher::<u32>::new());
            thread::scope(|scope| {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        aggregator.set_max_wait_time(Duration::from_secs(5));
                    }
                });
                scope.spawn(|| aggregator.set_max_batch_size(5));
            });
            check!(aggregator.limits() == BatchLimits::new(5, Duration::from_secs(5)));
        }
    }

    #[test]
    #[should_panic = "max_batch_size must not be zero"]
    fn rejects_zero_batch_size_at_runtime() {
        let (aggregator, handle) = Aggregator::new(CountingBatcher::<u32>::new());
        handle.forget();
        aggregator.set_max_batch_size(0);
    }

    #[test]
    fn drain_starts_a_worker_for_items_queued_without_one() {
        let (aggregator, _handle) = Aggregator::new(CountingBatcher::<u32>::new());
        // bypass push, like items left behind by a crashed worker
        aggregator.0.shared.queue.push(1);
        check!(!aggregator.is_running());
        check!(aggregator.drain());
        check!(aggregator.batcher().processed() == 1);
        check!(aggregator.stats().workers_started == 1);
        check!(!aggregator.is_running());
    }

    #[test]
    fn clear_queue_discards_items() {
        let (aggregator, handle) = Aggregator::new(CountingBatcher::<u32>::new());
        handle.forget();
        // bypass push so no worker picks the items up
        aggregator.0.shared.queue.push(1);
        aggregator.0.shared.queue.push(2);
        check!(aggregator.clear_queue() == 2);
        check!(aggregator.drain());
        check!(aggregator.batcher().processed() == 0);
        check!(aggregator.stats().workers_started == 0);
    }

    #[test]
    #[should_panic = "poll_interval must not be zero"]
    fn rejects_zero_poll_interval() {
        let _ = AggregatorBuilder::new().poll_interval(Duration::ZERO);
    }
}
