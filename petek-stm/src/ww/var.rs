//! The wound-wait transactional variable.
//!
//! A variable is two atomic pointers: `data`, the stable committed version,
//! and `record`, a nullable hand-off describing an in-flight writer. A
//! writer claims the cell by CAS-installing its record; the record names the
//! owning descriptor, the stable node it observed, and the tentative new
//! node. Readers never block: they pick the committed side of the record by
//! inspecting the owner's status.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use petek::{Atomic, Guard, Shared};

use crate::ww::descriptor::TxDescriptor;
use crate::ww::status::TxStatus;

/// One committed (or tentative) version of the value.
///
/// `write_ts` starts at the writer's `start_ts` and is stamped with the
/// commit timestamp just before publication, hence atomic in this flavor.
pub(crate) struct VersionNode<T> {
    pub(crate) write_ts: AtomicU64,
    pub(crate) payload: T,
}

/// The hand-off between an in-flight writer and everyone else.
///
/// `owner` and `old_node` are fixed at installation; `new_node` may be
/// replaced by the owner on a reentrant write while it is still `Active`,
/// which is exactly when no reader touches it.
pub(crate) struct WriteRecord<T> {
    pub(crate) owner: *const TxDescriptor,
    pub(crate) old_node: *mut VersionNode<T>,
    pub(crate) new_node: AtomicPtr<VersionNode<T>>,
}

/// Outcome of a write attempt.
pub(crate) enum TryWrite<T> {
    /// Our record is installed on the cell (or an earlier one was updated
    /// in place). Commit or abort will release it.
    Installed(*mut WriteRecord<T>),
    /// The cell is held by another active transaction; the value is handed
    /// back so the caller can retry after resolving the conflict.
    Owned {
        owner: *const TxDescriptor,
        value: T,
    },
    /// Our freshly installed record was stolen before the attempt finished:
    /// we have been wounded, and the thief owns the record's reclamation.
    Stolen,
}

/// Type-erased operations a write-set entry needs from its variable.
///
/// An explicit dispatch table instead of a virtual base: the engine only
/// needs this operation set, never a heterogeneous collection of variables.
#[derive(Clone, Copy)]
pub(crate) struct VarOps {
    pub(crate) commit: unsafe fn(*const (), *mut (), u64),
    pub(crate) abort: unsafe fn(*const (), *mut ()),
    pub(crate) data_version: unsafe fn(*const ()) -> u64,
}

/// A wound-wait transactional variable.
///
/// Stable address required while transactions reference it; dropping it
/// requires quiescence (no transaction in flight).
pub struct TMVar<T> {
    data: Atomic<VersionNode<T>>,
    record: Atomic<WriteRecord<T>>,
}

unsafe impl<T: Send + Sync> Send for TMVar<T> {}
unsafe impl<T: Send + Sync> Sync for TMVar<T> {}

impl<T: Send + Sync + 'static> TMVar<T> {
    /// Creates a variable holding `initial`.
    pub fn new(initial: T) -> Self {
        let node = Box::into_raw(Box::new(VersionNode {
            write_ts: AtomicU64::new(0),
            payload: initial,
        }));
        Self {
            data: Atomic::new(node),
            record: Atomic::null(),
        }
    }

    pub(crate) const OPS: VarOps = VarOps {
        commit: Self::commit_erased,
        abort: Self::abort_erased,
        data_version: Self::version_erased,
    };

    /// The committed version's timestamp; the unit of read validation.
    pub(crate) fn data_version(&self, guard: &Guard) -> u64 {
        // SAFETY: `data` is never null and is guard-protected.
        unsafe { self.data.load(Ordering::Acquire, guard).deref() }
            .write_ts
            .load(Ordering::Acquire)
    }

    /// Read the value this transaction should observe.
    ///
    /// No record: the stable node, linearized at the acquire load. Our own
    /// record: the tentative node (read-your-own-writes). A foreign record:
    /// the committed side, chosen by the owner's status.
    pub(crate) fn read_proxy(&self, me: *const TxDescriptor, guard: &Guard) -> T
    where
        T: Clone,
    {
        let record = self.record.load(Ordering::Acquire, guard);
        // SAFETY: record and both nodes it names are guard-protected; the
        // owner descriptor is retired through EBR, so it outlives our pin.
        unsafe {
            match record.as_ref() {
                None => self.data.load(Ordering::Acquire, guard).deref().payload.clone(),
                Some(rec) if rec.owner == me => {
                    (*rec.new_node.load(Ordering::Acquire)).payload.clone()
                }
                Some(rec) => {
                    if (*rec.owner).status.load(Ordering::Acquire) == TxStatus::Committed {
                        (*rec.new_node.load(Ordering::Acquire)).payload.clone()
                    } else {
                        (*rec.old_node).payload.clone()
                    }
                }
            }
        }
    }

    /// Try to claim the cell for `me`, writing `value`.
    ///
    /// Resolution of an active foreign owner is the caller's business (this
    /// is where wound-wait lives). Everything else is handled here:
    /// reentrant updates, waiting out committed-but-uncleaned owners,
    /// stealing from aborted owners, and the publication ABA recheck.
    ///
    /// # Safety
    ///
    /// `me` must be this thread's live descriptor for the current
    /// transaction; the caller must be pinned for at least as long as
    /// `guard`.
    pub(crate) unsafe fn try_write(
        &self,
        me: *const TxDescriptor,
        value: T,
        guard: &Guard,
    ) -> TryWrite<T> {
        let start_ts = unsafe { &*me }.start_ts;
        let new_node = Box::into_raw(Box::new(VersionNode {
            write_ts: AtomicU64::new(start_ts),
            payload: value,
        }));
        let mut my_record = Box::new(WriteRecord {
            owner: me,
            old_node: core::ptr::null_mut(),
            new_node: AtomicPtr::new(new_node),
        });

        loop {
            let current = self.record.load(Ordering::Acquire, guard);
            let stable = self.data.load(Ordering::Acquire, guard);
            my_record.old_node = stable.as_raw();

            // SAFETY: guard-protected record; EBR-retired owner descriptor.
            if let Some(rec) = unsafe { current.as_ref() } {
                if rec.owner == me {
                    // Reentrant write: replace the draft under our record.
                    let displaced = rec.new_node.swap(new_node, Ordering::AcqRel);
                    unsafe { petek::retire(displaced as *mut (), Self::node_deleter) };
                    drop(my_record);
                    return TryWrite::Installed(current.as_raw());
                }
                match unsafe { &*rec.owner }.status.load(Ordering::Acquire) {
                    TxStatus::Active => {
                        let owner = rec.owner;
                        // Hand the value back for the retry after conflict
                        // resolution.
                        let draft = unsafe { Box::from_raw(new_node) };
                        let value = draft.payload;
                        drop(my_record);
                        return TryWrite::Owned { owner, value };
                    }
                    TxStatus::Committed => {
                        // The winner is mid-publication; its record clears
                        // momentarily.
                        std::thread::yield_now();
                        continue;
                    }
                    TxStatus::Aborted => {
                        // Stealable; fall through to the CAS.
                    }
                }
            }

            let my_ptr = Box::into_raw(my_record);
            match self.record.compare_exchange(
                current,
                unsafe { Shared::from_raw(my_ptr) },
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Err(_) => {
                    // SAFETY: the CAS failed, so `my_ptr` never escaped.
                    my_record = unsafe { Box::from_raw(my_ptr) };
                    continue;
                }
                Ok(_) => {
                    // Stolen from an aborted owner: its draft is guaranteed
                    // unreferenced by any live transaction. Retire both.
                    if let Some(stolen) = unsafe { current.as_ref() } {
                        let draft = stolen.new_node.load(Ordering::Acquire);
                        unsafe {
                            petek::retire(draft as *mut (), Self::node_deleter);
                            petek::retire(current.as_raw() as *mut (), Self::record_deleter);
                        }
                    }

                    // ABA recheck: a commit may have slipped in between our
                    // snapshot of `data` and the CAS, in which case our
                    // record names a stale old node and must come out.
                    let now_stable = self.data.load(Ordering::Acquire, guard);
                    if now_stable.as_raw() != stable.as_raw() {
                        match self.record.compare_exchange(
                            unsafe { Shared::from_raw(my_ptr) },
                            Shared::null(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        ) {
                            Ok(_) => {
                                // SAFETY: removed before anyone could keep it.
                                my_record = unsafe { Box::from_raw(my_ptr) };
                                continue;
                            }
                            Err(_) => {
                                // A wounder already stole the record; it owns
                                // the reclamation.
                                return TryWrite::Stolen;
                            }
                        }
                    }

                    return TryWrite::Installed(my_ptr);
                }
            }
        }
    }

    /// Publish the record's draft at commit timestamp `wv` and release the
    /// cell. Only the committed owner calls this; its status CAS already
    /// succeeded, so the record cannot be stolen out from under us.
    pub(crate) unsafe fn commit_release(
        &self,
        record: *mut WriteRecord<T>,
        wv: u64,
        guard: &Guard,
    ) {
        let rec = unsafe { &*record };
        let new_node = rec.new_node.load(Ordering::Acquire);
        unsafe { &*new_node }.write_ts.store(wv, Ordering::Release);

        self.data
            .store(unsafe { Shared::from_raw(new_node) }, Ordering::Release);
        self.record.store(Shared::null(), Ordering::Release);
        let _ = guard;

        unsafe {
            petek::retire(rec.old_node as *mut (), Self::node_deleter);
            petek::retire(record as *mut (), Self::record_deleter);
        }
    }

    /// Take our record off the cell on abort. If the CAS fails the record
    /// was already stolen and the thief reclaims it; nothing to do.
    pub(crate) unsafe fn abort_restore(&self, record: *mut WriteRecord<T>, guard: &Guard) {
        let expected = unsafe { Shared::from_raw(record) };
        if self
            .record
            .compare_exchange(
                expected,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
        {
            let rec = unsafe { &*record };
            let draft = rec.new_node.load(Ordering::Acquire);
            unsafe {
                petek::retire(draft as *mut (), Self::node_deleter);
                petek::retire(record as *mut (), Self::record_deleter);
            }
        }
    }

    unsafe fn commit_erased(var: *const (), record: *mut (), wv: u64) {
        let var = unsafe { &*(var as *const TMVar<T>) };
        let guard = petek::pin();
        unsafe { var.commit_release(record as *mut WriteRecord<T>, wv, &guard) };
    }

    unsafe fn abort_erased(var: *const (), record: *mut ()) {
        let var = unsafe { &*(var as *const TMVar<T>) };
        let guard = petek::pin();
        unsafe { var.abort_restore(record as *mut WriteRecord<T>, &guard) };
    }

    unsafe fn version_erased(var: *const ()) -> u64 {
        let var = unsafe { &*(var as *const TMVar<T>) };
        let guard = petek::pin();
        var.data_version(&guard)
    }

    pub(crate) unsafe fn node_deleter(ptr: *mut ()) {
        unsafe { drop(Box::from_raw(ptr as *mut VersionNode<T>)) };
    }

    pub(crate) unsafe fn record_deleter(ptr: *mut ()) {
        // Nodes named by the record are retired separately.
        unsafe { drop(Box::from_raw(ptr as *mut WriteRecord<T>)) };
    }
}

impl<T> Drop for TMVar<T> {
    fn drop(&mut self) {
        // Precondition: quiescence. No transaction is in flight on this
        // variable, so whatever the pointers name is exclusively ours.
        unsafe {
            let record = self.record.load_unprotected(Ordering::Relaxed);
            if !record.is_null() {
                let draft = (*record).new_node.load(Ordering::Relaxed);
                if !draft.is_null() {
                    drop(Box::from_raw(draft));
                }
                drop(Box::from_raw(record));
            }
            let data = self.data.load_unprotected(Ordering::Relaxed);
            if !data.is_null() {
                drop(Box::from_raw(data));
            }
        }
    }
}
