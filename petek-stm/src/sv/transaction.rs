//! The single-version OCC transaction.
//!
//! Structurally the twin of the multi-version transaction; only the variable
//! interaction differs (no history walk, a single-version validator).

use core::sync::atomic::{fence, Ordering};

use petek::Guard;

use crate::clock;
use crate::descriptor::{destroy_boxed, Descriptor};
use crate::errors::{ConflictKind, StmError, StmResult};
use crate::lock_table;
use crate::sv::var::{TVar, VersionNode};

/// A transaction handle passed to the `atomically` closure.
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

        if let Some(node) = self.desc.find_own_write(addr) {
            let node = node as *const VersionNode<T>;
            // SAFETY: drafts in the write set are private and well-typed.
            return Ok(unsafe { &*node }.payload.clone());
        }

        if lock_table::table().is_locked(addr) {
            return Err(StmError::Conflict(ConflictKind::Locked));
        }

        let rv = self.desc.read_version();
        match var.load_visible(rv, self.guard) {
            Some(payload) => {
                let value = payload.clone();
                self.desc.add_to_read_set(addr, TVar::<T>::validate);
                Ok(value)
            }
            // The only version is newer than our snapshot.
            None => Err(StmError::Conflict(ConflictKind::Stale)),
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

    /// Allocate storage tied to the transaction outcome. See
    /// [`crate::mv::Transaction::alloc`].
    pub fn alloc<T>(&mut self, value: T) -> *mut T
    where
        T: Send + Sync + 'static,
    {
        let ptr = Box::into_raw(Box::new(value));
        self.desc.track_allocation(ptr as *mut (), destroy_boxed::<T>);
        ptr
    }

    /// Schedule `ptr` for destruction if this transaction commits. See
    /// [`crate::mv::Transaction::free`].
    ///
    /// # Safety
    ///
    /// Same contract as the multi-version flavor's `free`.
    pub unsafe fn free<T>(&mut self, ptr: *mut T)
    where
        T: Send + Sync + 'static,
    {
        if ptr.is_null() {
            return;
        }
        self.desc.track_free(ptr as *mut (), destroy_boxed::<T>);
    }

    /// Run `hook` after a successful commit.
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
