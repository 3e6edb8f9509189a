// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The unbounded multi-producer queue between [`Aggregator::push`](crate::Aggregator::push) and the
//! background worker.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};

/// A FIFO queue that any number of threads can push into and at most one [`Consumer`] at a time
/// pops from.
///
/// Pushing never blocks and never fails. Items pushed by the same thread are popped in the order
/// they were pushed; the interleaving between threads is whatever order the pushes landed in.
pub struct Queue<T> {
    // SegQueue rather than crossbeam's ArrayQueue: nothing is ever dropped, the queue grows instead
    items: SegQueue<T>,
    // Owned by the current consumer for as long as it lives
    parker: Mutex<Parker>,
    // Lets producers (and drain requests) cheaply wake up the consumer
    unparker: Unparker,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        Self {
            items: SegQueue::new(),
            parker: Mutex::new(parker),
            unparker,
        }
    }

    /// Append `item` to the back of the queue and wake the consumer, if it is parked.
    pub fn push(&self, item: T) {
        self.items.push(item);
        // Ordering between the push and the unpark doesn't matter much: a consumer that misses the
        // wakeup re-checks the queue after at most one poll interval.
        self.unparker.unpark();
    }

    /// Wake the consumer without pushing anything, so it re-checks its exit conditions.
    pub fn wake(&self) {
        self.unparker.unpark();
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Remove every queued item and return how many were removed.
    ///
    /// This is a maintenance operation: items removed here are never processed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        while self.items.pop().is_some() {
            removed += 1;
        }
        removed
    }

    /// Become the consumer of this queue, blocking while another consumer is still alive.
    pub fn consumer(&self) -> Consumer<'_, T> {
        Consumer {
            items: &self.items,
            parker: self.parker.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// The single consuming end of a [`Queue`]. See [`Queue::consumer`].
pub struct Consumer<'a, T> {
    items: &'a SegQueue<T>,
    parker: MutexGuard<'a, Parker>,
}

impl<T> Consumer<'_, T> {
    /// Remove and return the oldest item, or `None` if the queue is empty.
    pub fn try_pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Remove and return the oldest item, parking in slices of `poll_interval` until one is available.
    pub fn pop_blocking(&mut self, poll_interval: Duration) -> T {
        loop {
            if let Some(item) = self.items.pop() {
                return item;
            }
            self.park_timeout(poll_interval);
        }
    }

    /// Park until the queue is woken up or `timeout` passes. May return spuriously.
    pub fn park_timeout(&mut self, timeout: Duration) {
        self.parker.park_timeout(timeout);
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use assert2::check;

    use super::*;

    #[test]
    fn pops_in_push_order() {
        let queue = Queue::new();
        for i in 0..10 {
            queue.push(i);
        }
        check!(queue.len() == 10);
        let mut consumer = queue.consumer();
        let popped: Vec<_> = std::iter::from_fn(|| consumer.try_pop()).collect();
        check!(popped == (0..10).collect::<Vec<_>>());
        check!(consumer.is_empty());
    }

    #[test]
    fn clear_reports_removed_items() {
        let queue = Queue::new();
        queue.push("a");
        queue.push("b");
        check!(queue.clear() == 2);
        check!(queue.is_empty());
        check!(queue.clear() == 0);
    }

    #[test]
    fn pop_blocking_wakes_on_push() {
        let queue = Arc::new(Queue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(7u32);
            })
        };
        let start = Instant::now();
        let item = queue.consumer().pop_blocking(Duration::from_secs(30));
        check!(item == 7);
        // woken by the unpark in push, not by the poll interval
        check!(start.elapsed() < Duration::from_secs(30));
        producer.join().unwrap();
    }

    #[test]
    fn keeps_per_producer_order() {
        let queue = Queue::new();
        thread::scope(|scope| {
            for t in 0..8u32 {
                let queue = &queue;
                scope.spawn(move || {
                    for i in 0..100u32 {
                        queue.push((t, i));
                    }
                });
            }
        });
        let mut consumer = queue.consumer();
        let mut next = [0u32; 8];
        while let Some((t, i)) = consumer.try_pop() {
            check!(next[t as usize] == i);
            next[t as usize] += 1;
        }
        check!(next == [100; 8]);
    }
}
