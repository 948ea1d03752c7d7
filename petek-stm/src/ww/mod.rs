//! Wound-wait concurrency control.
//!
//! No central lock table: a writer claims a variable by installing a write
//! record naming its descriptor. When two writers collide, age decides:
//! the transaction with the smaller `start_ts` wounds the younger one by
//! CAS-ing its status to `Aborted`, and the younger self-aborts when it is
//! on the losing side. Aborted owners' records are stolen in place, so a
//! crashed-out transaction never strands a variable.
//!
//! A writer's commit linearizes at its `Active → Committed` status CAS;
//! wound-versus-commit races are decided by that single word.

mod context;
mod descriptor;
mod status;
mod var;

pub use context::TxContext;
pub use status::TxStatus;
pub use var::TMVar;

use core::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use crossbeam_utils::Backoff;

use crate::errors::{StmError, StmResult};

thread_local! {
    static CONTEXT: RefCell<TxContext> = RefCell::new(TxContext::new());
}

/// Run `f` as a wound-wait transaction, retrying until it commits.
///
/// Conflicts (including being wounded) never escape; the closure is re-run
/// with a fresh descriptor. A panic inside the closure aborts the attempt,
/// releasing every held record, and then propagates.
///
/// Nested calls on the same thread are a usage error and panic.
///
/// # Example
///
/// ```
/// use petek_stm::ww::{atomically, TMVar};
///
/// let cell = TMVar::new(5);
/// atomically(|tx| {
///     let v = tx.load(&cell)?;
///     tx.store(&cell, v * 2)?;
///     Ok(())
/// });
/// assert_eq!(atomically(|tx| tx.load(&cell)), 10);
/// ```
pub fn atomically<F, T>(mut f: F) -> T
where
    F: FnMut(&mut TxContext) -> StmResult<T>,
{
    CONTEXT.with(|cell| {
        let mut ctx = cell
            .try_borrow_mut()
            .expect("nested atomically() on the same thread");
        let backoff = Backoff::new();

        loop {
            ctx.begin();

            let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut ctx)));
            match outcome {
                Ok(Ok(value)) => {
                    if ctx.commit() {
                        return value;
                    }
                }
                Ok(Err(StmError::Conflict(_))) => ctx.abort(),
                Err(panic) => {
                    ctx.abort();
                    resume_unwind(panic);
                }
            }

            backoff.snooze();
        }
    })
}
