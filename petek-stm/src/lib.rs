//! Software transactional memory over Petek's epoch reclamation.
//!
//! # Architecture
//!
//! Three concurrency-control flavors share one skeleton (begin / load /
//! store / commit) and one ambient infrastructure (global version clock,
//! striped lock table, epoch reclamation):
//!
//! - [`mv`]: multi-version OCC. Each variable keeps a bounded chain of
//!   version nodes; readers walk the chain to the newest version at or below
//!   their read timestamp. TL2-style commit with strict head validation.
//! - [`sv`]: single-version OCC. One version node per variable; the commit
//!   path is the same TL2 dance without the history walk.
//! - [`ww`]: wound-wait. No central lock table: writers claim a variable by
//!   installing a write record; conflicts are resolved by transaction age,
//!   the older transaction forcibly aborting ("wounding") the younger.
//!
//! Each flavor exposes `atomically(closure)` and its own variable type.
//! Conflicts are reported as [`StmError::Conflict`] and retried by the
//! wrapper with backoff; they never escape. Panics from the closure
//! propagate after the transaction's side effects are rolled back.
//!
//! Displaced version nodes and write records are handed to
//! [`petek::retire`], so a reader that still holds a pointer into a
//! variable's history can finish its walk safely.
//!
//! # Example
//!
//! ```
//! use petek_stm::mv::{atomically, TVar};
//!
//! let counter = TVar::new(0);
//! atomically(|tx| {
//!     let v = tx.load(&counter)?;
//!     tx.store(&counter, v + 1);
//!     Ok(())
//! });
//! assert_eq!(atomically(|tx| tx.load(&counter)), 1);
//! ```

#![warn(missing_docs)]

mod clock;
mod descriptor;
mod errors;
mod lock_table;

pub mod mv;
pub mod sv;
pub mod ww;

pub use errors::{ConflictKind, StmError, StmResult};
pub use lock_table::TABLE_SIZE;
