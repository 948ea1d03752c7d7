//! The multi-version transactional variable.

use core::sync::atomic::Ordering;

use petek::{Atomic, Guard, Shared};

use crate::mv::MAX_HISTORY;

/// One immutable version of a variable's value.
///
/// `write_ts` is stamped exactly once, inside the committer and before the
/// node becomes reachable from the variable's head.
pub(crate) struct VersionNode<T> {
    pub(crate) write_ts: u64,
    pub(crate) prev: Atomic<VersionNode<T>>,
    pub(crate) payload: T,
}

impl<T> VersionNode<T> {
    pub(crate) fn boxed(payload: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            write_ts: 0,
            prev: Atomic::null(),
            payload,
        }))
    }
}

/// A multi-version transactional variable.
///
/// Owns a chain of version nodes, newest first, capped at
/// [`MAX_HISTORY`](crate::mv::MAX_HISTORY) retained versions. Readers walk
/// the chain for the newest version at or below their read timestamp;
/// versions past the cap are detached and retired through the reclamation
/// system, so a reader that already holds a detached node finishes safely.
///
/// The variable must have a stable address while transactions reference it;
/// share it by reference or through `Arc`. Dropping it requires quiescence:
/// no transaction may still be using it.
pub struct TVar<T> {
    pub(crate) head: Atomic<VersionNode<T>>,
}

unsafe impl<T: Send + Sync> Send for TVar<T> {}
unsafe impl<T: Send + Sync> Sync for TVar<T> {}

impl<T: Send + Sync + 'static> TVar<T> {
    /// Creates a variable holding `initial`, visible to every read version.
    pub fn new(initial: T) -> Self {
        Self {
            head: Atomic::new(VersionNode::boxed(initial)),
        }
    }

    /// Walk the chain for the newest version with `write_ts <= rv`.
    pub(crate) fn load_visible<'g>(&self, rv: u64, guard: &'g Guard) -> Option<&'g T> {
        let mut curr = self.head.load(Ordering::Acquire, guard);
        // SAFETY: nodes on the chain are protected by the guard, including
        // any tail detached concurrently by a committer.
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.write_ts <= rv {
                return Some(&node.payload);
            }
            curr = node.prev.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Strict TL2 validation: the head must not be newer than `rv`.
    ///
    /// Walking older versions here would admit lost updates: a newer head
    /// proves a conflicting commit happened after this transaction began,
    /// so the transaction must retry against the fresh value.
    pub(crate) unsafe fn validate(var: *const (), rv: u64) -> bool {
        let var = unsafe { &*(var as *const TVar<T>) };
        let guard = petek::pin();
        match unsafe { var.head.load(Ordering::Acquire, &guard).as_ref() } {
            None => true,
            Some(head) => head.write_ts <= rv,
        }
    }

    /// Publish `node` at commit timestamp `wv`, then trim the history.
    ///
    /// Runs with the variable's stripe locked, so this is the only writer.
    /// The walk stops [`MAX_HISTORY`] steps in; anything beyond is cut off
    /// by nulling the link and retired as a chain.
    pub(crate) unsafe fn committer(var: *const (), node: *mut (), wv: u64) {
        let var = unsafe { &*(var as *const TVar<T>) };
        let node = node as *mut VersionNode<T>;
        let guard = petek::pin();

        // Stamp and link before the node becomes reachable.
        let old_head = var.head.load(Ordering::Relaxed, &guard);
        unsafe {
            (*node).write_ts = wv;
            (*node).prev.store(old_head, Ordering::Relaxed);
            var.head.store(Shared::from_raw(node), Ordering::Release);
        }

        // Trim: find the node MAX_HISTORY steps from the new head.
        let mut depth = 0;
        let mut curr = unsafe { Shared::from_raw(node) };
        while !curr.is_null() && depth < MAX_HISTORY {
            curr = unsafe { curr.deref() }.prev.load(Ordering::Acquire, &guard);
            depth += 1;
        }

        if let Some(cut) = unsafe { curr.as_ref() } {
            let tail = cut.prev.load(Ordering::Acquire, &guard);
            if !tail.is_null() {
                // Logical detach: concurrent readers already past the cut
                // still hold the tail and read it under their guard.
                cut.prev.store(Shared::null(), Ordering::Release);
                unsafe { petek::retire(tail.as_raw() as *mut (), Self::chain_deleter) };
            }
        }
    }

    /// Deleter for a detached history segment: frees the whole chain.
    pub(crate) unsafe fn chain_deleter(ptr: *mut ()) {
        let mut node = ptr as *mut VersionNode<T>;
        while !node.is_null() {
            // SAFETY: the segment is quiescent; we are its sole owner.
            let next = unsafe { (*node).prev.load_unprotected(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(node)) };
            node = next;
        }
    }

    /// Deleter for a single draft node that was never published.
    pub(crate) unsafe fn node_deleter(ptr: *mut ()) {
        unsafe { drop(Box::from_raw(ptr as *mut VersionNode<T>)) };
    }
}

impl<T> Drop for TVar<T> {
    fn drop(&mut self) {
        // Quiescence is a documented precondition: no transaction is in
        // flight, so the attached chain is exclusively ours. Detached
        // segments already belong to the reclamation system.
        let mut node = unsafe { self.head.load_unprotected(Ordering::Relaxed) };
        while !node.is_null() {
            let next = unsafe { (*node).prev.load_unprotected(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(node)) };
            node = next;
        }
    }
}
