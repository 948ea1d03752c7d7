//! The single-version transactional variable.

use core::sync::atomic::Ordering;

use petek::{Atomic, Guard, Shared};

/// The one committed version of a variable.
pub(crate) struct VersionNode<T> {
    pub(crate) write_ts: u64,
    pub(crate) payload: T,
}

impl<T> VersionNode<T> {
    pub(crate) fn boxed(payload: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            write_ts: 0,
            payload,
        }))
    }
}

/// A single-version transactional variable.
///
/// Holds exactly one version node; writers publish by replacing the head and
/// retiring the displaced node. Readers conflict whenever the head is newer
/// than their read timestamp, the price of keeping no history.
///
/// Stable address and drop-at-quiescence requirements are the same as for
/// the multi-version variable.
pub struct TVar<T> {
    pub(crate) head: Atomic<VersionNode<T>>,
}

unsafe impl<T: Send + Sync> Send for TVar<T> {}
unsafe impl<T: Send + Sync> Sync for TVar<T> {}

impl<T: Send + Sync + 'static> TVar<T> {
    /// Creates a variable holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            head: Atomic::new(VersionNode::boxed(initial)),
        }
    }

    /// The current version, if visible at `rv`.
    pub(crate) fn load_visible<'g>(&self, rv: u64, guard: &'g Guard) -> Option<&'g T> {
        // SAFETY: the head is never null and is protected by the guard.
        let head = unsafe { self.head.load(Ordering::Acquire, guard).deref() };
        (head.write_ts <= rv).then(|| &head.payload)
    }

    /// Validation: the head must not be newer than `rv`.
    pub(crate) unsafe fn validate(var: *const (), rv: u64) -> bool {
        let var = unsafe { &*(var as *const TVar<T>) };
        let guard = petek::pin();
        match unsafe { var.head.load(Ordering::Acquire, &guard).as_ref() } {
            None => true,
            Some(head) => head.write_ts <= rv,
        }
    }

    /// Publish `node` at `wv`: stamp, swap the head, retire the old version.
    pub(crate) unsafe fn committer(var: *const (), node: *mut (), wv: u64) {
        let var = unsafe { &*(var as *const TVar<T>) };
        let node = node as *mut VersionNode<T>;
        let guard = petek::pin();

        unsafe { (*node).write_ts = wv };
        let old = var
            .head
            .swap(unsafe { Shared::from_raw(node) }, Ordering::AcqRel, &guard);
        if !old.is_null() {
            // Readers pinned before the swap may still hold the old node.
            unsafe { petek::retire(old.as_raw() as *mut (), Self::node_deleter) };
        }
    }

    /// Deleter for a version node.
    pub(crate) unsafe fn node_deleter(ptr: *mut ()) {
        unsafe { drop(Box::from_raw(ptr as *mut VersionNode<T>)) };
    }
}

impl<T> Drop for TVar<T> {
    fn drop(&mut self) {
        // Precondition: quiescence. The head is exclusively ours.
        let head = unsafe { self.head.load_unprotected(Ordering::Relaxed) };
        if !head.is_null() {
            unsafe { drop(Box::from_raw(head)) };
        }
    }
}
