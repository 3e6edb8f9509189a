// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use crate::batcher::{Batcher, PoisonAction};
pub use crate::error::{CycleError, Stage};
pub use crate::limits::BatchLimits;

pub mod batcher;
pub mod error;
pub mod limits;
