// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains the [`Batcher`] trait, which is the consumer side of a batching aggregator.

use std::fmt;

/// Folds items into batches and commits completed batches.
///
/// An aggregator calls every method of a `Batcher` from its single background worker thread, but the
/// `Batcher` itself is shared with the threads that own the aggregator (e.g. to read counters kept by
/// [`Batcher::finish`]), which is why the methods take `&self`. Keep mutable state behind atomics or a
/// [`Mutex`](std::sync::Mutex).
///
/// # Example
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use batchline_core::Batcher;
///
/// #[derive(Default)]
/// struct LineCounter {
///     lines: AtomicUsize,
/// }
///
/// impl Batcher for LineCounter {
///     type Item = String;
///     type Batch = Vec<String>;
///     type Error = std::convert::Infallible;
///
///     fn new_batch(&self) -> Vec<String> {
///         Vec::new()
///     }
///
///     fn process(&self, batch: &mut Vec<String>, item: String) -> Result<(), Self::Error> {
///         batch.push(item);
///         Ok(())
///     }
///
///     fn finish(&self, batch: Vec<String>) -> Result<(), Self::Error> {
///         self.lines.fetch_add(batch.len(), Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
pub trait Batcher: Send + Sync + 'static {
    /// The values pushed into the aggregator.
    type Item: Send + 'static;

    /// The accumulator built during one accumulation cycle.
    type Batch;

    /// Error returned by [`Batcher::process`] and [`Batcher::finish`].
    type Error: fmt::Display + fmt::Debug;

    /// Create an empty batch. Called when the first item of an accumulation cycle is popped from
    /// the queue. The batch is only kept if that item is processed successfully, so cycles that see
    /// no items, or whose first item is poisoned, never finish a batch.
    fn new_batch(&self) -> Self::Batch;

    /// Fold `item` into `batch`.
    ///
    /// This should only build the batch; side effects belong in [`Batcher::finish`]. Returning an
    /// error marks `item` as poisoned: it is dropped and never retried, and [`Batcher::on_poisoned`]
    /// decides what happens to the rest of the cycle. If you mutate `batch` before failing, undo the
    /// mutation, since the partially built batch is still handed to [`Batcher::finish`].
    fn process(&self, batch: &mut Self::Batch, item: Self::Item) -> Result<(), Self::Error>;

    /// Commit a completed batch.
    ///
    /// Called exactly once for every batch holding at least one processed item, on every exit path
    /// of the cycle (size limit, time limit, drain, or a poisoned item). An error here ends the worker
    /// thread and the batch is lost as a whole.
    fn finish(&self, batch: Self::Batch) -> Result<(), Self::Error>;

    /// Decide what to do after [`Batcher::process`] failed.
    ///
    /// The default drops the item and ends the worker thread after finishing the partial batch. The
    /// next `push` or `drain` starts a fresh worker which continues with the remaining items.
    /// Override this to dead-letter the error (the error type can carry the item) or to keep the
    /// worker running.
    fn on_poisoned(&self, error: &Self::Error) -> PoisonAction {
        let _ = error;
        PoisonAction::Crash
    }
}

/// What the worker does after an item was poisoned. See [`Batcher::on_poisoned`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoisonAction {
    /// Finish the partial batch, then end the worker thread.
    #[default]
    Crash,
    /// Drop the item and keep accumulating the current batch.
    Skip,
}

impl<B: Batcher> Batcher for std::sync::Arc<B> {
    type Item = B::Item;
    type Batch = B::Batch;
    type Error = B::Error;

    fn new_batch(&self) -> Self::Batch {
        (**self).new_batch()
    }

    fn process(&self, batch: &mut Self::Batch, item: Self::Item) -> Result<(), Self::Error> {
        (**self).process(batch, item)
    }

    fn finish(&self, batch: Self::Batch) -> Result<(), Self::Error> {
        (**self).finish(batch)
    }

    fn on_poisoned(&self, error: &Self::Error) -> PoisonAction {
        (**self).on_poisoned(error)
    }
}
