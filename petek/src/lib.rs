//! Petek: epoch-based memory reclamation for structures with lock-free readers.
//!
//! Petek implements the classic three-epoch scheme. Readers enter a critical
//! section with [`pin`]; writers hand displaced objects to [`retire`] together
//! with a type-erased deleter. An object retired in epoch `e` is freed no
//! earlier than epoch `e + 2`, by which point every reader that could have
//! observed it has left its critical section.
//!
//! # Key properties
//!
//! - **Cheap reads**: entering a critical section is one counter increment
//!   plus one fence on the outermost entry; loads inside are plain atomics.
//! - **Reentrant**: nested [`pin`] calls are counted; only the outermost one
//!   publishes the thread's epoch.
//! - **Batched reclamation**: retired objects accumulate in per-thread
//!   buckets; epoch advancement is attempted only when a bucket passes
//!   [`RETIRE_THRESHOLD`].
//! - **No per-thread leaks**: a thread that exits migrates its pending
//!   buckets into a shared orphan queue drained by later advancers.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::Ordering;
//! use petek::{pin, retire_boxed, Atomic, Shared};
//!
//! let atomic = Atomic::new(Box::into_raw(Box::new(42)));
//!
//! let guard = pin();
//! let shared = atomic.load(Ordering::Acquire, &guard);
//!
//! // Replace the value and retire the displaced node.
//! let fresh = Box::into_raw(Box::new(43));
//! let old = atomic.swap(unsafe { Shared::from_raw(fresh) }, Ordering::AcqRel, &guard);
//! unsafe {
//!     assert_eq!(*shared.deref(), 42);
//!     retire_boxed(old.as_raw());
//! }
//! drop(guard);
//!
//! # petek::flush();
//! # let guard = pin();
//! # unsafe { retire_boxed(atomic.load(Ordering::Acquire, &guard).as_raw()) };
//! # drop(guard);
//! # petek::flush();
//! ```

#![warn(missing_docs)]

mod atomic;
mod bag;
mod epoch;
mod guard;
mod participant;

pub use atomic::{Atomic, Shared};
pub use bag::Deleter;
pub use guard::{flush, pin, retire, retire_boxed, Guard};

/// Number of retired objects a per-thread bucket may hold before an epoch
/// advance is attempted.
pub const RETIRE_THRESHOLD: usize = 2048;
