//! Multi-version optimistic concurrency control.
//!
//! Each [`TVar`] keeps a bounded history of committed versions, so readers
//! rarely conflict with writers: a load walks back to the newest version at
//! or below the transaction's read timestamp. Commits take the TL2 path:
//! lock the write set's stripes in a global order, mint a commit timestamp,
//! validate the read set strictly against the heads, publish, unlock.
//!
//! History past [`MAX_HISTORY`] versions is detached from the chain and
//! retired; a reader that raced past the cut finishes its walk under its
//! epoch guard and the next attempt sees the trimmed chain.

mod transaction;
mod var;

pub use transaction::Transaction;
pub use var::TVar;

use core::cell::RefCell;

use crossbeam_utils::Backoff;

use crate::clock;
use crate::descriptor::Descriptor;
use crate::errors::{StmError, StmResult};

/// Number of versions a variable retains before the tail is detached and
/// retired.
pub const MAX_HISTORY: usize = 8;

thread_local! {
    static DESCRIPTOR: RefCell<Descriptor> = RefCell::new(Descriptor::new());
}

/// Run `f` as a transaction, retrying on conflict until it commits.
///
/// The closure may run any number of times; it must confine its side effects
/// to transactional operations (or register them with
/// [`Transaction::on_commit`]). Conflicts never escape. A panic inside the
/// closure propagates after the attempt's effects are rolled back.
///
/// Nested calls on the same thread are a usage error and panic.
///
/// # Example
///
/// ```
/// use petek_stm::mv::{atomically, TVar};
///
/// let var = TVar::new(10);
/// let seen = atomically(|tx| {
///     let v = tx.load(&var)?;
///     tx.store(&var, v + 5);
///     Ok(v)
/// });
/// assert_eq!(seen, 10);
/// assert_eq!(atomically(|tx| tx.load(&var)), 15);
/// ```
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_table;

    #[test]
    fn history_is_capped_and_old_reads_conflict() {
        use crate::errors::{ConflictKind, StmError};

        let var = TVar::new(0usize);
        let first_ts = clock::now() + 1;
        for i in 1..=(MAX_HISTORY * 3) {
            atomically(|tx| {
                tx.store(&var, i);
                Ok(())
            });
        }
        assert_eq!(atomically(|tx| tx.load(&var)), MAX_HISTORY * 3);

        // A read version older than the oldest retained write_ts must
        // conflict with the truncated history.
        let guard = petek::pin();
        let mut desc = Descriptor::new();
        desc.begin(first_ts);
        let mut tx = Transaction::new(&mut desc, &guard);
        assert_eq!(
            tx.load(&var),
            Err(StmError::Conflict(ConflictKind::Truncated))
        );
    }

    /// A stripe collision between a read target and our own write target
    /// must still validate: the lock we see is our own.
    #[test]
    fn self_locked_stripe_passes_validation() {
        use std::collections::HashMap;

        let table = lock_table::table();

        // Allocate vars until two distinct ones share a stripe (birthday
        // bound: ~a thousand tries against 2^20 stripes).
        let mut vars: Vec<Box<TVar<i32>>> = Vec::new();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let (read_pos, write_pos) = loop {
            let var = Box::new(TVar::new(1));
            let idx = table.stripe_of(&*var as *const TVar<i32> as *const ());
            vars.push(var);
            if let Some(&earlier) = seen.get(&idx) {
                break (earlier, vars.len() - 1);
            }
            seen.insert(idx, vars.len() - 1);
        };

        // Read one, write the other: validation sees the shared stripe
        // locked (by us) and must pass.
        let seen_value = atomically(|tx| {
            let a = tx.load(&vars[read_pos])?;
            tx.store(&vars[write_pos], a + 10);
            Ok(a)
        });
        assert_eq!(seen_value, 1);
        assert_eq!(atomically(|tx| tx.load(&vars[write_pos])), 11);
    }
}
