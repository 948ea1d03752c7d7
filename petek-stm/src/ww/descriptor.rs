//! The wound-wait transaction descriptor.
//!
//! Unlike the OCC descriptor, this one is shared: any writer that finds our
//! record on a variable reads our status and may wound us through it. It is
//! therefore heap-allocated per transaction with a stable address, and
//! retired through the reclamation system at cleanup: a conflicting
//! transaction may still be dereferencing it through a record it loaded
//! just before we finished.

use crate::ww::status::AtomicStatus;

/// Identity and fate of one wound-wait transaction.
#[repr(align(64))]
pub(crate) struct TxDescriptor {
    pub(crate) status: AtomicStatus,
    /// Transaction age; wound-wait resolves conflicts in favor of the
    /// smaller (older) value, descriptor address breaking ties.
    pub(crate) start_ts: u64,
}

impl TxDescriptor {
    pub(crate) fn boxed(start_ts: u64) -> *mut Self {
        Box::into_raw(Box::new(Self {
            status: AtomicStatus::new(),
            start_ts,
        }))
    }
}

/// Deleter for a retired descriptor.
pub(crate) unsafe fn descriptor_deleter(ptr: *mut ()) {
    // SAFETY: retired exactly once, after every record naming it was
    // removed from its variable.
    unsafe { drop(Box::from_raw(ptr as *mut TxDescriptor)) };
}
