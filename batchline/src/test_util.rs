// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! [`CountingBatcher`] is a [`Batcher`] that records what it was asked to do, for testing code that
//! owns an [`Aggregator`](crate::Aggregator).
//!
//! This requires that the `test-util` feature be enabled.

use std::{
    fmt,
    marker::PhantomData,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use batchline_core::{Batcher, PoisonAction};

/// A [`Batcher`] that collects items into a `Vec` and counts finished batches and their items.
///
/// Items matching the predicate set with [`CountingBatcher::poison_when`] fail in
/// [`Batcher::process`].
///
/// # Example
/// ```
/// # use batchline::{Aggregator, test_util::CountingBatcher};
/// let (aggregator, _handle) = Aggregator::new(CountingBatcher::<u32>::new());
/// for i in 0..10 {
///     aggregator.push(i);
/// }
/// aggregator.drain();
/// assert_eq!(aggregator.batcher().processed(), 10);
/// ```
pub struct CountingBatcher<T> {
    processed: AtomicUsize,
    finishes: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    poison: Option<fn(&T) -> bool>,
    poison_action: PoisonAction,
    _item: PhantomData<fn(T)>,
}

/// The error returned by [`CountingBatcher`] for poisoned items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonedItem(pub String);

impl fmt::Display for PoisonedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poisoned item {}", self.0)
    }
}

impl std::error::Error for PoisonedItem {}

impl<T> Default for CountingBatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CountingBatcher<T> {
    /// Create a batcher that accepts every item.
    pub fn new() -> Self {
        Self {
            processed: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            poison: None,
            poison_action: PoisonAction::Crash,
            _item: PhantomData,
        }
    }

    /// Fail [`Batcher::process`] for every item matching `poison`.
    pub fn poison_when(mut self, poison: fn(&T) -> bool) -> Self {
        self.poison = Some(poison);
        self
    }

    /// What [`Batcher::on_poisoned`] answers. Defaults to [`PoisonAction::Crash`].
    pub fn poison_action(mut self, action: PoisonAction) -> Self {
        self.poison_action = action;
        self
    }

    /// Items in successfully finished batches.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Number of finished batches.
    pub fn finishes(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    /// Sizes of the finished batches, in the order they were finished.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.processed.store(0, Ordering::SeqCst);
        self.finishes.store(0, Ordering::SeqCst);
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<T: fmt::Debug + Send + 'static> Batcher for CountingBatcher<T> {
    type Item = T;
    type Batch = Vec<T>;
    type Error = PoisonedItem;

    fn new_batch(&self) -> Vec<T> {
        Vec::new()
    }

    fn process(&self, batch: &mut Vec<T>, item: T) -> Result<(), PoisonedItem> {
        if self.poison.is_some_and(|poison| poison(&item)) {
            return Err(PoisonedItem(format!("{item:?}")));
        }
        batch.push(item);
        Ok(())
    }

    fn finish(&self, batch: Vec<T>) -> Result<(), PoisonedItem> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.len());
        self.processed.fetch_add(batch.len(), Ordering::SeqCst);
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_poisoned(&self, _error: &PoisonedItem) -> PoisonAction {
        self.poison_action
    }
}
