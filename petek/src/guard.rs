//! Guard and per-thread handle for critical-section management.
//!
//! The handle owns the thread's three retire buckets and a reference to its
//! registry participant. `pin()` enters a critical section (reentrant),
//! `retire()` batches an object into the bucket for the current epoch, and
//! crossing [`crate::RETIRE_THRESHOLD`] triggers an epoch-advance attempt.

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;

use crate::bag::{Bag, Deleter};
use crate::epoch::STATE;
use crate::participant::Participant;
use crate::RETIRE_THRESHOLD;

/// RAII guard representing an active critical section.
///
/// While a guard exists, every pointer loaded from an [`crate::Atomic`] on
/// this thread stays valid, even if a writer retires it concurrently.
/// Dropping the last guard on a thread leaves the critical section and makes
/// the thread's epoch slot eligible for advancement.
#[must_use]
pub struct Guard {
    /// False for the dummy guard handed out during TLS teardown, which never
    /// entered a critical section and must not leave one.
    pinned: bool,
    // !Send + !Sync: the guard is tied to this thread's participant slot.
    _marker: PhantomData<*mut ()>,
}

impl Drop for Guard {
    #[inline]
    fn drop(&mut self) {
        if self.pinned {
            // try_with: during process teardown TLS may already be gone.
            let _ = HANDLE.try_with(|handle| handle.unpin());
        }
    }
}

/// Per-thread reclamation state.
struct Handle {
    participant: Cell<Option<&'static Participant>>,
    /// Three retire buckets, indexed by epoch residue.
    buckets: [RefCell<Bag>; 3],
}

impl Handle {
    const fn new() -> Self {
        Self {
            participant: Cell::new(None),
            buckets: [
                RefCell::new(Bag::new()),
                RefCell::new(Bag::new()),
                RefCell::new(Bag::new()),
            ],
        }
    }

    #[inline]
    fn participant(&self) -> &'static Participant {
        match self.participant.get() {
            Some(p) => p,
            None => {
                let p = STATE.enroll();
                self.participant.set(Some(p));
                p
            }
        }
    }

    #[inline]
    fn pin(&self) -> Guard {
        self.participant().enter(STATE.global_epoch_word());
        Guard {
            pinned: true,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn unpin(&self) {
        if let Some(p) = self.participant.get() {
            p.exit();
        }
    }

    /// Batch `ptr` for deferred destruction.
    ///
    /// # Safety
    ///
    /// See [`retire`].
    unsafe fn retire(&self, ptr: *mut (), deleter: Deleter) {
        let epoch = STATE.epoch();
        let idx = (epoch % 3) as usize;
        let mut bag = self.buckets[idx].borrow_mut();

        if bag.epoch != epoch {
            if !bag.is_empty() {
                // Same residue, older epoch: the contents are at least three
                // epochs old, hence quiescent.
                unsafe { bag.free_all() };
            }
            bag.epoch = epoch;
        }

        bag.push(ptr, deleter);
        let full = bag.len() >= RETIRE_THRESHOLD;
        drop(bag);

        if full {
            self.advance_and_collect();
        }
    }

    /// Attempt one epoch advance, then free whatever became quiescent.
    fn advance_and_collect(&self) {
        STATE.try_advance();
        let current = STATE.epoch();
        for bucket in &self.buckets {
            let mut bag = bucket.borrow_mut();
            if !bag.is_empty() && bag.epoch + 2 <= current {
                // SAFETY: the epoch has moved two steps past the bag's tag.
                unsafe { bag.free_all() };
            }
        }
        STATE.drain_orphans(current);
    }

    /// Force-reclaim: repeatedly advance so this thread's pending buckets
    /// (and any orphans) become quiescent and are freed.
    fn flush(&self) {
        for _ in 0..3 {
            self.advance_and_collect();
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Thread exit: hand non-empty buckets to the orphan queue and give
        // the participant slot back for reuse.
        for bucket in &self.buckets {
            let mut bag = bucket.borrow_mut();
            if !bag.is_empty() {
                STATE.adopt(bag.take());
            }
        }
        if let Some(p) = self.participant.get() {
            p.active
                .store(false, core::sync::atomic::Ordering::Release);
        }
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// Enter a critical section.
///
/// Returns a [`Guard`]; while it lives, pointers loaded from
/// [`crate::Atomic`]s on this thread remain valid. Nested calls are cheap
/// and merely share the outermost guard's protection.
#[inline]
pub fn pin() -> Guard {
    // During process teardown TLS may be destroyed; hand out a dummy guard
    // whose drop is a no-op.
    HANDLE.try_with(|handle| handle.pin()).unwrap_or_else(|_| Guard {
        pinned: false,
        _marker: PhantomData,
    })
}

/// Retire an object for deferred destruction.
///
/// The object is destroyed by `deleter` once every thread pinned at retire
/// time has unpinned (concretely: once the global epoch has advanced twice).
///
/// # Safety
///
/// - `ptr` must point to a valid heap object matching what `deleter` expects.
/// - `ptr` must already be unreachable from shared structures, so that no
///   new readers can acquire it.
/// - `ptr` must not be retired more than once, and the caller must not
///   access it afterwards.
#[inline]
pub unsafe fn retire(ptr: *mut (), deleter: Deleter) {
    // During process teardown TLS may be destroyed; leak, the OS reclaims.
    let _ = HANDLE.try_with(|handle| unsafe { handle.retire(ptr, deleter) });
}

/// Retire a `Box`-allocated object.
///
/// Convenience wrapper over [`retire`] whose deleter reconstitutes and drops
/// the `Box<T>`.
///
/// # Safety
///
/// Same contract as [`retire`], with `ptr` obtained from `Box::into_raw`.
#[inline]
pub unsafe fn retire_boxed<T: 'static>(ptr: *mut T) {
    unsafe fn deleter<T>(ptr: *mut ()) {
        // SAFETY: `ptr` came from `Box::into_raw::<T>` and is dropped once.
        unsafe { drop(Box::from_raw(ptr as *mut T)) };
    }
    unsafe { retire(ptr as *mut (), deleter::<T>) };
}

/// Flush the calling thread's retired objects.
///
/// Attempts several epoch advances and frees every bucket and orphan that
/// became quiescent. Other threads' buckets are not touched; each thread
/// flushes its own state (or exits, which migrates it to the orphan queue).
pub fn flush() {
    let _ = HANDLE.try_with(|handle| handle.flush());
}
