//! Single-version optimistic concurrency control.
//!
//! The leanest flavor: one committed version per [`TVar`], TL2 commit
//! protocol, no history. Readers pay for the simplicity by conflicting with
//! any commit that lands after their snapshot, so it shines when
//! transactions are short or read sets are small.

mod transaction;
mod var;

pub use transaction::Transaction;
pub use var::TVar;

use core::cell::RefCell;

use crossbeam_utils::Backoff;

use crate::clock;
use crate::descriptor::Descriptor;
use crate::errors::{StmError, StmResult};

thread_local! {
    static DESCRIPTOR: RefCell<Descriptor> = RefCell::new(Descriptor::new());
}

/// Run `f` as a transaction, retrying on conflict until it commits.
///
/// Semantics are identical to [`crate::mv::atomically`], over single-version
/// variables.
pub fn atomically<F, T>(mut f: F) -> T
where
    F: FnMut(&mut Transaction<'_>) -> StmResult<T>,
{
    DESCRIPTOR.with(|cell| {
        let mut desc = cell
            .try_borrow_mut()
            .expect("nested atomically() on the same thread");
        let backoff = Backoff::new();

        loop {
            let guard = petek::pin();
            desc.begin(clock::now());
            let mut tx = Transaction::new(&mut desc, &guard);

            match f(&mut tx) {
                Ok(value) => {
                    if tx.commit() {
                        return value;
                    }
                }
                Err(StmError::Conflict(_)) => drop(tx),
            }

            drop(guard);
            backoff.snooze();
        }
    })
}
