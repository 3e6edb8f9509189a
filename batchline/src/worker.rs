// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The background worker: runs accumulation cycles until its generation is drained or a cycle fails.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use batchline_core::{BatchLimits, Batcher, CycleError, PoisonAction, Stage};

use crate::{
    queue::{Consumer, Queue},
    rate_limit::RateLimit,
    stats::Counters,
};

/// How often a single aggregator may log a skipped poisoned item.
pub(crate) const SKIP_WARNING_INTERVAL: Duration = Duration::from_secs(1);

/// State shared between the aggregator handles and every worker generation.
pub(crate) struct Shared<B: Batcher> {
    pub(crate) batcher: B,
    pub(crate) queue: Queue<B::Item>,
    pub(crate) limits: Limits,
    pub(crate) poll_interval: Duration,
    pub(crate) name: String,
    pub(crate) counters: Counters,
    pub(crate) skip_warnings: RateLimit,
}

/// [`BatchLimits`] that can be changed between cycles. The worker takes a snapshot at the start of
/// every cycle.
pub(crate) struct Limits {
    max_batch_size: AtomicUsize,
    max_wait_time_nanos: AtomicU64,
}

impl Limits {
    pub(crate) fn new(limits: BatchLimits) -> Self {
        let this = Self {
            max_batch_size: AtomicUsize::new(0),
            max_wait_time_nanos: AtomicU64::new(0),
        };
        this.store(limits);
        this
    }

    pub(crate) fn store(&self, limits: BatchLimits) {
        self.store_max_batch_size(limits.max_batch_size());
        self.store_max_wait_time(limits.max_wait_time());
    }

    // Each field is stored on its own so concurrent setters for different fields can't undo each other
    pub(crate) fn store_max_batch_size(&self, max_batch_size: usize) {
        self.max_batch_size.store(max_batch_size, Ordering::Relaxed);
    }

    pub(crate) fn store_max_wait_time(&self, max_wait_time: Duration) {
        let nanos = max_wait_time.as_nanos().try_into().unwrap_or(u64::MAX);
        self.max_wait_time_nanos.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> BatchLimits {
        BatchLimits::new(
            self.max_batch_size.load(Ordering::Relaxed),
            Duration::from_nanos(self.max_wait_time_nanos.load(Ordering::Relaxed)),
        )
    }
}

/// One worker thread's lifetime, from spawn to termination.
pub(crate) struct Generation {
    id: u64,
    // false -> true at most once per generation
    draining: AtomicBool,
    finished: Mutex<bool>,
    finished_signal: Condvar,
}

impl Generation {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            draining: AtomicBool::new(false),
            finished: Mutex::new(false),
            finished_signal: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn request_drain(&self) {
        // Release so that the worker sees every item pushed before the drain request
        self.draining.store(true, Ordering::Release);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the worker of this generation has stopped touching the queue.
    pub(crate) fn wait_finished(&self) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        while !*finished {
            finished = self
                .finished_signal
                .wait(finished)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn mark_finished(&self) {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.finished_signal.notify_all();
    }
}

// Marks the generation finished on every exit path of the thread, unwinding included
struct FinishOnExit<'a>(&'a Generation);

impl Drop for FinishOnExit<'_> {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleEnd {
    // batch finished (or never started), run another cycle
    Continue,
    // queue empty and drain requested, the generation is done
    Drained,
}

/// Thread entry point of a worker generation.
pub(crate) fn run<B: Batcher>(shared: &Shared<B>, generation: &Generation) {
    let span = tracing::span!(
        tracing::Level::TRACE,
        "batchline worker",
        aggregator = %shared.name,
        generation = generation.id()
    );
    let _enter = span.enter();
    // declared before the consumer so the queue is released before the generation reports finished
    let _finish = FinishOnExit(generation);
    let mut consumer = shared.queue.consumer();
    tracing::info!(aggregator = %shared.name, "starting worker thread");

    let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), CycleError<B::Error>> {
        loop {
            if run_cycle(shared, generation, &mut consumer)? == CycleEnd::Drained {
                return Ok(());
            }
        }
    }))
    .unwrap_or_else(|payload| Err(CycleError::panicked(Stage::Process, payload)));

    match result {
        Ok(()) => {
            tracing::info!(aggregator = %shared.name, "queue drained, worker thread stopping");
        }
        Err(err) => {
            shared.counters.crashed();
            tracing::warn!(
                aggregator = %shared.name,
                %err,
                queue_len = shared.queue.len(),
                "worker thread crashed"
            );
        }
    }
}

/// Runs one accumulation cycle. The batch, if one was created, is finished on every exit path.
fn run_cycle<B: Batcher>(
    shared: &Shared<B>,
    generation: &Generation,
    consumer: &mut Consumer<'_, B::Item>,
) -> Result<CycleEnd, CycleError<B::Error>> {
    if consumer.is_empty() && generation.is_draining() {
        return Ok(CycleEnd::Drained);
    }

    let limits = shared.limits.load();
    let mut batch = None;
    let mut items_in_batch = 0;
    let filled = fill_batch(
        shared,
        generation,
        consumer,
        limits,
        &mut batch,
        &mut items_in_batch,
    );

    let finished = match batch {
        Some(batch) => finish_batch(shared, batch, items_in_batch),
        None => Ok(()),
    };

    match (filled, finished) {
        (Err(err), Err(finish_err)) => {
            // the cycle error wins, but don't lose the finish error entirely
            tracing::warn!(
                aggregator = %shared.name,
                err = %finish_err,
                "couldn't finish partial batch after poisoned item"
            );
            Err(err)
        }
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Ok(()), Ok(())) => Ok(CycleEnd::Continue),
    }
}

fn fill_batch<B: Batcher>(
    shared: &Shared<B>,
    generation: &Generation,
    consumer: &mut Consumer<'_, B::Item>,
    limits: BatchLimits,
    batch: &mut Option<B::Batch>,
    items_in_batch: &mut usize,
) -> Result<(), CycleError<B::Error>> {
    let cycle_start = Instant::now();
    while *items_in_batch < limits.max_batch_size() {
        let elapsed = cycle_start.elapsed();
        if elapsed >= limits.max_wait_time() {
            break;
        }

        let Some(item) = consumer.try_pop() else {
            if generation.is_draining() {
                break;
            }
            let remaining = limits.max_wait_time() - elapsed;
            consumer.park_timeout(shared.poll_interval.min(remaining));
            continue;
        };

        let processed = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(batch) = batch.as_mut() {
                return shared.batcher.process(batch, item);
            }
            // a batch whose first item failed is never finished
            let mut first = shared.batcher.new_batch();
            shared.batcher.process(&mut first, item)?;
            *batch = Some(first);
            Ok(())
        }));

        match processed {
            Ok(Ok(())) => {
                *items_in_batch += 1;
                shared.counters.item_processed();
            }
            Ok(Err(err)) => {
                shared.counters.item_poisoned();
                match shared.batcher.on_poisoned(&err) {
                    PoisonAction::Crash => return Err(CycleError::Process(err)),
                    PoisonAction::Skip => {
                        if shared.skip_warnings.allow() {
                            tracing::warn!(
                                aggregator = %shared.name,
                                %err,
                                "skipping poisoned item"
                            );
                        }
                    }
                }
            }
            Err(payload) => {
                shared.counters.item_poisoned();
                return Err(CycleError::panicked(Stage::Process, payload));
            }
        }
    }
    Ok(())
}

fn finish_batch<B: Batcher>(
    shared: &Shared<B>,
    batch: B::Batch,
    items_in_batch: usize,
) -> Result<(), CycleError<B::Error>> {
    match panic::catch_unwind(AssertUnwindSafe(|| shared.batcher.finish(batch))) {
        Ok(Ok(())) => {
            shared.counters.batch_finished();
            tracing::debug!(aggregator = %shared.name, items = items_in_batch, "finished batch");
            Ok(())
        }
        Ok(Err(err)) => Err(CycleError::Finish(err)),
        Err(payload) => Err(CycleError::panicked(Stage::Finish, payload)),
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;
    use crate::test_util::CountingBatcher;

    fn shared(batcher: CountingBatcher<u32>, limits: BatchLimits) -> Shared<CountingBatcher<u32>> {
        Shared {
            batcher,
            queue: Queue::new(),
            limits: Limits::new(limits),
            poll_interval: Duration::from_millis(5),
            name: "test".into(),
            counters: Counters::default(),
            skip_warnings: RateLimit::new(SKIP_WARNING_INTERVAL),
        }
    }

    #[test]
    fn limits_round_trip_through_atomics() {
        let limits = Limits::new(BatchLimits::new(7, Duration::from_millis(250)));
        check!(limits.load() == BatchLimits::new(7, Duration::from_millis(250)));
        limits.store(BatchLimits::new(3, Duration::from_secs(5)));
        check!(limits.load().max_batch_size() == 3);
    }

    #[test]
    fn storing_one_limit_leaves_the_other_alone() {
        let limits = Limits::new(BatchLimits::new(10, Duration::from_secs(1)));
        limits.store_max_batch_size(5);
        check!(limits.load() == BatchLimits::new(5, Duration::from_secs(1)));
        limits.store_max_wait_time(Duration::from_secs(5));
        check!(limits.load() == BatchLimits::new(5, Duration::from_secs(5)));
    }

    #[test]
    fn drained_generation_with_empty_queue_ends_without_a_batch() {
        let shared = shared(CountingBatcher::<u32>::new(), BatchLimits::default());
        let generation = Generation::new(1);
        generation.request_drain();
        let mut consumer = shared.queue.consumer();
        check!(run_cycle(&shared, &generation, &mut consumer).unwrap() == CycleEnd::Drained);
        check!(shared.batcher.finishes() == 0);
    }

    #[test]
    fn cycle_stops_at_size_limit() {
        let shared = shared(
            CountingBatcher::<u32>::new(),
            BatchLimits::new(4, Duration::from_secs(60)),
        );
        for i in 0..10 {
            shared.queue.push(i);
        }
        let generation = Generation::new(1);
        let mut consumer = shared.queue.consumer();
        check!(run_cycle(&shared, &generation, &mut consumer).unwrap() == CycleEnd::Continue);
        check!(shared.batcher.batch_sizes() == vec![4]);
        check!(shared.queue.len() == 6);
    }

    #[test]
    fn cycle_stops_at_time_limit() {
        let shared = shared(
            CountingBatcher::<u32>::new(),
            BatchLimits::new(1000, Duration::from_millis(30)),
        );
        shared.queue.push(1);
        let generation = Generation::new(1);
        let mut consumer = shared.queue.consumer();
        let start = Instant::now();
        check!(run_cycle(&shared, &generation, &mut consumer).unwrap() == CycleEnd::Continue);
        check!(start.elapsed() >= Duration::from_millis(30));
        check!(shared.batcher.batch_sizes() == vec![1]);
    }

    #[test]
    fn poisoned_item_finishes_partial_batch() {
        let shared = shared(
            CountingBatcher::<u32>::new().poison_when(|item| *item == 3),
            BatchLimits::new(10, Duration::from_secs(60)),
        );
        for i in 0..6 {
            shared.queue.push(i);
        }
        let generation = Generation::new(1);
        let mut consumer = shared.queue.consumer();
        let err = run_cycle(&shared, &generation, &mut consumer).unwrap_err();
        check!(matches!(err, CycleError::Process(_)));
        // 0, 1, 2 were finished, 3 was dropped, 4 and 5 are still queued
        check!(shared.batcher.batch_sizes() == vec![3]);
        check!(shared.queue.len() == 2);
        check!(shared.counters.snapshot().items_poisoned == 1);
    }

    #[test]
    fn run_marks_generation_finished_after_crash() {
        let shared = shared(
            CountingBatcher::<u32>::new().poison_when(|item| *item == 0),
            BatchLimits::default(),
        );
        shared.queue.push(0);
        shared.queue.push(1);
        let generation = Generation::new(1);
        run(&shared, &generation);
        check!(generation.is_finished());
        check!(shared.counters.snapshot().crashes == 1);
        // the poisoned item was the first of its cycle, so no batch exists to finish
        check!(shared.batcher.finishes() == 0);
        check!(shared.queue.len() == 1);
    }

    #[test]
    fn skip_warnings_are_limited_per_aggregator() {
        use std::{
            io,
            sync::{Arc, Mutex},
        };

        #[derive(Clone, Default)]
        struct Captured(Arc<Mutex<Vec<u8>>>);

        impl io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let skipping = || {
            shared(
                CountingBatcher::<u32>::new()
                    .poison_when(|item| item % 2 == 0)
                    .poison_action(PoisonAction::Skip),
                BatchLimits::new(10, Duration::from_secs(60)),
            )
        };
        let first = skipping();
        let second = skipping();
        tracing::subscriber::with_default(subscriber, || {
            for shared in [&first, &second] {
                for i in 0..10 {
                    shared.queue.push(i);
                }
                let generation = Generation::new(1);
                generation.request_drain();
                let mut consumer = shared.queue.consumer();
                let end = run_cycle(shared, &generation, &mut consumer).unwrap();
                check!(end == CycleEnd::Continue);
            }
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        // five skips each, one warning each
        check!(output.matches("skipping poisoned item").count() == 2);
        check!(first.counters.snapshot().items_poisoned == 5);
        check!(second.counters.snapshot().items_poisoned == 5);
        check!(first.batcher.batch_sizes() == vec![5]);
    }
}
