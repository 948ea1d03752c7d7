//! The multi-version OCC transaction.

use core::sync::atomic::{fence, Ordering};

use petek::Guard;

use crate::clock;
use crate::descriptor::{destroy_boxed, Descriptor};
use crate::errors::{ConflictKind, StmError, StmResult};
use crate::lock_table;
use crate::mv::var::{TVar, VersionNode};

/// A transaction handle passed to the `atomically` closure.
///
/// Loads observe the snapshot at the transaction's read version; stores are
/// buffered and published atomically at commit. An attempt that ends without
/// committing rolls back its drafts, its transactional allocations, and runs
/// any registered rollback hooks.
pub struct Transaction<'t> {
    pub(crate) desc: &'t mut Descriptor,
    pub(crate) guard: &'t Guard,
    post_commit: Vec<Box<dyn FnOnce()>>,
    post_rollback: Vec<Box<dyn FnOnce()>>,
    committed: bool,
}

impl<'t> Transaction<'t> {
    pub(crate) fn new(desc: &'t mut Descriptor, guard: &'t Guard) -> Self {
        Self {
            desc,
            guard,
            post_commit: Vec::new(),
            post_rollback: Vec::new(),
            committed: false,
        }
    }

    /// Read a variable at this transaction's read version.
    pub fn load<T>(&mut self, var: &TVar<T>) -> StmResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let addr = var as *const TVar<T> as *const ();

        // 1. Read-your-own-writes: the newest buffered store wins.
        if let Some(node) = self.desc.find_own_write(addr) {
            let node = node as *const VersionNode<T>;
            // SAFETY: drafts in the write set are private and well-typed.
            return Ok(unsafe { &*node }.payload.clone());
        }

        // 2. A stripe held by a committing writer means the head is in
        // flux; back off rather than read a half-published chain state.
        if lock_table::table().is_locked(addr) {
            return Err(StmError::Conflict(ConflictKind::Locked));
        }

        // 3. Find the newest version at or below the read version.
        let rv = self.desc.read_version();
        match var.load_visible(rv, self.guard) {
            Some(payload) => {
                let value = payload.clone();
                self.desc.add_to_read_set(addr, TVar::<T>::validate);
                Ok(value)
            }
            // History truncated past our snapshot.
            None => Err(StmError::Conflict(ConflictKind::Truncated)),
        }
    }

    /// Buffer a store; it becomes visible atomically at commit.
    pub fn store<T>(&mut self, var: &TVar<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let addr = var as *const TVar<T> as *const ();
        let node = VersionNode::boxed(value);
        self.desc.add_to_write_set(
            addr,
            node as *mut (),
            TVar::<T>::committer,
            TVar::<T>::node_deleter,
        );
    }

    /// Allocate storage whose existence is tied to the transaction outcome.
    ///
    /// On commit the pointer is the caller's to own (typically it was linked
    /// into a transactional structure). If the attempt aborts, the value is
    /// destroyed and the storage released.
    pub fn alloc<T>(&mut self, value: T) -> *mut T
    where
        T: Send + Sync + 'static,
    {
        let ptr = Box::into_raw(Box::new(value));
        self.desc.track_allocation(ptr as *mut (), destroy_boxed::<T>);
        ptr
    }

    /// Schedule `ptr` for destruction if this transaction commits.
    ///
    /// The destruction is deferred through the reclamation system, so
    /// concurrent readers that still hold the pointer finish safely. If the
    /// attempt aborts, the pointer is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Transaction::alloc`] (or `Box::into_raw` of
    /// the same `T`), must be unlinked from shared structures by this
    /// transaction's writes, and must not be freed again.
    pub unsafe fn free<T>(&mut self, ptr: *mut T)
    where
        T: Send + Sync + 'static,
    {
        if ptr.is_null() {
            return;
        }
        self.desc.track_free(ptr as *mut (), destroy_boxed::<T>);
    }

    /// Run `hook` after a successful commit, once all locks are released.
    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        self.post_commit.push(Box::new(hook));
    }

    /// Run `hook` if this attempt ends without committing.
    pub fn on_rollback<F>(&mut self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        self.post_rollback.push(Box::new(hook));
    }

    /// Attempt to commit. `false` means conflict; the caller retries.
    pub(crate) fn commit(mut self) -> bool {
        // Read-only fast path: the snapshot was consistent by construction.
        if self.desc.write_set_is_empty() {
            self.desc.commit_allocations();
            self.desc.reset();
            self.finish_commit();
            return true;
        }

        self.desc.lock_write_set();
        let wv = clock::tick();

        if !self.validate_read_set() {
            self.desc.unlock_write_set();
            // Drop rolls back drafts, allocations and runs rollback hooks.
            return false;
        }

        self.desc.publish_write_set(wv);
        self.desc.unlock_write_set();
        self.desc.commit_allocations();
        self.desc.reset();
        self.finish_commit();
        true
    }

    fn finish_commit(&mut self) {
        self.committed = true;
        for hook in self.post_commit.drain(..) {
            hook();
        }
    }

    /// TL2 post-validation, run with the write-set stripes held.
    ///
    /// For each read: the stripe must be free (or ours, on a collision with
    /// our own write set), the validator must accept the read version, and,
    /// after a full fence, the stripe must still be free. The fence orders
    /// the validator's head read before the second lock check, closing the
    /// window where a writer locks between our two observations.
    fn validate_read_set(&self) -> bool {
        let rv = self.desc.read_version();
        let table = lock_table::table();

        for entry in self.desc.read_set() {
            let index = table.stripe_of(entry.var);

            if table.is_locked_index(index) && !self.desc.holds_stripe(index) {
                return false;
            }

            // SAFETY: the entry was created by the typed `load` for this var.
            if !unsafe { (entry.validator)(entry.var, rv) } {
                return false;
            }

            fence(Ordering::SeqCst);

            if table.is_locked_index(index) && !self.desc.holds_stripe(index) {
                return false;
            }
        }
        true
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.desc.rollback_writes();
            self.desc.rollback_allocations();
            self.desc.reset();
            for hook in self.post_rollback.drain(..) {
                hook();
            }
        }
    }
}
