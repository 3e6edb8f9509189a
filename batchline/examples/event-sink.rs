//! Example: batching access-log events into newline-delimited writes.
//!
//! Request handlers on several threads push events; the aggregator's worker groups them into
//! batches of at most 50 events, or whatever arrived within 250ms, and writes each batch with a
//! single call. Run with `RUST_LOG=batchline=debug` to see the worker lifecycle.

use std::fmt::Write as _;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use batchline::{AggregatorBuilder, Batcher};

#[derive(Debug)]
struct AccessEvent {
    path: &'static str,
    status: u16,
    latency: Duration,
}

/// Renders each batch to one string, then writes it in one go.
struct AccessLog<W> {
    out: Mutex<W>,
}

impl<W: std::io::Write + Send + 'static> Batcher for AccessLog<W> {
    type Item = AccessEvent;
    type Batch = String;
    type Error = std::io::Error;

    fn new_batch(&self) -> String {
        String::new()
    }

    fn process(&self, batch: &mut String, event: AccessEvent) -> Result<(), std::io::Error> {
        if event.path.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "event without a path",
            ));
        }
        // writing into a String can't fail
        let _ = writeln!(
            batch,
            "{} {} {}ms",
            event.status,
            event.path,
            event.latency.as_millis()
        );
        Ok(())
    }

    fn finish(&self, batch: String) -> Result<(), std::io::Error> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(batch.as_bytes())?;
        out.flush()
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let (aggregator, handle) = AggregatorBuilder::new()
        .name("access-log")
        .max_batch_size(50)
        .max_wait_time(Duration::from_millis(250))
        .build(AccessLog {
            out: Mutex::new(std::io::stdout()),
        });

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let aggregator = aggregator.clone();
            scope.spawn(move || {
                for request in 0..40u64 {
                    aggregator.push(AccessEvent {
                        path: if request % 2 == 0 { "/health" } else { "/orders" },
                        status: if request % 13 == 0 { 503 } else { 200 },
                        latency: Duration::from_millis(worker * 10 + request % 7),
                    });
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }
    });

    // drains the queue and stops the worker
    handle.shut_down();

    let stats = aggregator.stats();
    eprintln!(
        "wrote {} events in {} batches",
        stats.items_processed, stats.batches_finished
    );
}
