// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains the [`global_aggregator`] macro, which defines process-wide rendezvous points between the
//! code that pushes items and an [`Aggregator`] attached during startup.
//!
//! Globals are harder to test and create implicit interfaces. Prefer passing an [`Aggregator`] around
//! explicitly; use a global when many unrelated components need to push into the same aggregator.

use crate::{Aggregator, AggregatorBuilder, Batcher};

/// A global [`Aggregator`] that can be referred to by type name from any thread.
///
/// Implemented by the types defined with [`global_aggregator!`]. Nothing is created implicitly:
/// an aggregator has to be attached with [`GlobalAggregator::attach`] before items can be pushed.
pub trait GlobalAggregator {
    /// The consumer of the attached aggregator.
    type Batcher: Batcher;

    /// Build an aggregator from `builder` and attach it to this global.
    ///
    /// Dropping the returned [`AttachHandle`] drains and stops the aggregator and detaches it.
    ///
    /// # Panics
    /// If an aggregator is already attached.
    fn attach(builder: AggregatorBuilder, batcher: Self::Batcher) -> AttachHandle;

    /// A clone of the attached aggregator, if any.
    fn try_aggregator() -> Option<Aggregator<Self::Batcher>>;

    /// Whether an aggregator is currently attached.
    fn is_attached() -> bool {
        Self::try_aggregator().is_some()
    }

    /// A clone of the attached aggregator.
    ///
    /// # Panics
    /// If no aggregator is attached.
    #[track_caller]
    fn aggregator() -> Aggregator<Self::Batcher> {
        Self::try_aggregator().expect("aggregator must be `attach()`ed before use")
    }

    /// Push `item` into the attached aggregator, handing it back if none is attached.
    fn try_push(
        item: <Self::Batcher as Batcher>::Item,
    ) -> Result<(), <Self::Batcher as Batcher>::Item> {
        match Self::try_aggregator() {
            Some(aggregator) => {
                aggregator.push(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Push `item` into the attached aggregator.
    ///
    /// # Panics
    /// If no aggregator is attached.
    #[track_caller]
    fn push(item: <Self::Batcher as Batcher>::Item) {
        if Self::try_push(item).is_err() {
            panic!("aggregator must be `attach()`ed before pushing")
        }
    }

    /// [`Aggregator::drain`] the attached aggregator. Does nothing if none is attached.
    fn drain() -> bool {
        Self::try_aggregator().is_none_or(|aggregator| aggregator.drain())
    }
}

/// Handle that, when dropped, stops the attached global aggregator and then detaches it.
///
/// After detaching, a new aggregator can be attached.
#[must_use = "if unused the global aggregator will be immediately stopped and detached"]
pub struct AttachHandle {
    detach: Option<fn()>,
}

impl AttachHandle {
    // pub so it can be accessed through macro
    #[doc(hidden)]
    pub fn new(detach: fn()) -> Self {
        Self {
            detach: Some(detach),
        }
    }

    /// Keep the aggregator attached forever.
    ///
    /// Queued items are then only flushed during shutdown if something else drains the aggregator.
    pub fn forget(mut self) {
        self.detach = None;
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Define a new [`GlobalAggregator`] that can be referenced by type name in all threads.
///
/// ## Examples
///
/// ```
/// use batchline::{AggregatorBuilder, GlobalAggregator, global_aggregator, test_util::CountingBatcher};
///
/// global_aggregator! {
///     /// Audit events of the whole service
///     pub AuditEvents: CountingBatcher<String>
/// }
///
/// let handle = AuditEvents::attach(AggregatorBuilder::new(), CountingBatcher::new());
///
/// // Can use from any thread
/// AuditEvents::push("user logged in".to_string());
///
/// AuditEvents::drain();
/// assert_eq!(AuditEvents::aggregator().batcher().processed(), 1);
///
/// // When dropped, `handle` drains the aggregator and detaches it.
/// drop(handle);
/// assert!(!AuditEvents::is_attached());
/// ```
#[macro_export]
macro_rules! global_aggregator {
    ($(#[$attr:meta])* $vis:vis $name:ident: $batcher:ty) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name;

        const _: () = {
            use ::std::{sync::{PoisonError, RwLock}, option::Option::{self, Some, None}};
            use $crate::{Aggregator, AggregatorBuilder, global::{AttachHandle, GlobalAggregator}};

            const NAME: &'static str = ::std::stringify!($name);
            static AGGREGATOR: RwLock<Option<Aggregator<$batcher>>> = RwLock::new(None);

            impl GlobalAggregator for $name {
                type Batcher = $batcher;

                fn attach(builder: AggregatorBuilder, batcher: $batcher) -> AttachHandle {
                    let mut write = AGGREGATOR.write().unwrap_or_else(PoisonError::into_inner);
                    if write.is_some() {
                        drop(write); // don't poison
                        panic!(
                            "Already attached a global {NAME} aggregator, drop the attach handle \
                             first if intentionally attaching a new one"
                        );
                    }
                    let (aggregator, handle) = builder.name_if_unset(NAME).build(batcher);
                    // the attach handle takes over stopping the aggregator
                    handle.forget();
                    *write = Some(aggregator);
                    AttachHandle::new(|| {
                        let detached = AGGREGATOR
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        if let Some(aggregator) = detached {
                            aggregator.stop();
                        }
                    })
                }

                fn try_aggregator() -> Option<Aggregator<$batcher>> {
                    AGGREGATOR.read().unwrap_or_else(PoisonError::into_inner).clone()
                }
            }
        };
    };
}
pub use global_aggregator;
