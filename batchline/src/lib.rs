// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use batchline_core::{BatchLimits, Batcher, CycleError, PoisonAction, Stage};

pub use crate::aggregator::{Aggregator, AggregatorBuilder, AggregatorJoinHandle};
pub use crate::global::{AttachHandle, GlobalAggregator};
pub use crate::stats::AggregatorStats;

mod aggregator;
pub mod global;
pub mod queue;
pub(crate) mod rate_limit;
mod stats;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
mod worker;

#[doc(hidden)]
pub use batchline_core as core;
