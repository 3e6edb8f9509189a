// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Errors that end an accumulation cycle.

use std::{any::Any, fmt};

/// The consumer callback that was running when a cycle failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// [`Batcher::process`](crate::Batcher::process)
    Process,
    /// [`Batcher::finish`](crate::Batcher::finish)
    Finish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Finish => f.write_str("finish"),
        }
    }
}

/// The error cases that end an accumulation cycle and with it the worker thread.
#[derive(Debug)]
pub enum CycleError<E> {
    /// An item was poisoned: [`Batcher::process`](crate::Batcher::process) returned an error.
    Process(E),
    /// [`Batcher::finish`](crate::Batcher::finish) returned an error. The batch is lost.
    Finish(E),
    /// A consumer callback panicked.
    Panicked {
        /// The callback that panicked.
        stage: Stage,
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl<E> CycleError<E> {
    /// Build a [`CycleError::Panicked`] from a payload returned by [`std::panic::catch_unwind`].
    pub fn panicked(stage: Stage, payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked {
            stage,
            message: panic_message(payload.as_ref()),
        }
    }

    /// The consumer callback that failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Process(_) => Stage::Process,
            Self::Finish(_) => Stage::Finish,
            Self::Panicked { stage, .. } => *stage,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CycleError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(err) => write!(f, "poisoned item: {err}"),
            Self::Finish(err) => write!(f, "couldn't finish batch: {err}"),
            Self::Panicked { stage, message } => write!(f, "{stage} panicked: {message}"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for CycleError<E> {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn formats_each_case() {
        check!(CycleError::Process("bad item").to_string() == "poisoned item: bad item");
        check!(CycleError::Finish("disk full").to_string() == "couldn't finish batch: disk full");
        let err = CycleError::<&str>::panicked(Stage::Finish, Box::new("boom"));
        check!(err.to_string() == "finish panicked: boom");
        check!(err.stage() == Stage::Finish);
    }

    #[test]
    fn extracts_owned_and_opaque_payloads() {
        let owned = CycleError::<String>::panicked(Stage::Process, Box::new(format!("item {}", 7)));
        check!(owned.to_string() == "process panicked: item 7");
        let opaque = CycleError::<String>::panicked(Stage::Process, Box::new(42u8));
        check!(opaque.to_string() == "process panicked: non-string panic payload");
    }
}
