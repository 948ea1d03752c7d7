//! Per-thread transaction descriptor for the OCC flavors.
//!
//! The descriptor holds the read set, write set, lock set and allocation
//! logs. It is thread-owned and reused across transactions: `reset` clears
//! the sets but keeps their capacity, so a hot transaction loop settles into
//! zero allocation for bookkeeping.
//!
//! Entries are type-erased through plain function pointers: a small
//! dispatch table per entry instead of trait objects, so the sets stay
//! `Copy`-friendly and flat.

use crate::lock_table;

/// Checks that a variable is still consistent with a read version.
pub(crate) type Validator = unsafe fn(*const (), u64) -> bool;

/// Publishes a prepared node into a variable at a commit timestamp.
pub(crate) type Committer = unsafe fn(*const (), *mut (), u64);

/// Destroys an object that was never published (abort path) or has become
/// unreachable (via the reclamation system).
pub(crate) type Destroyer = unsafe fn(*mut ());

pub(crate) struct ReadEntry {
    pub var: *const (),
    pub validator: Validator,
}

pub(crate) struct WriteEntry {
    pub var: *const (),
    pub new_node: *mut (),
    pub committer: Committer,
    pub deleter: Destroyer,
}

struct AllocEntry {
    ptr: *mut (),
    destroyer: Destroyer,
}

pub(crate) struct Descriptor {
    read_version: u64,
    read_set: Vec<ReadEntry>,
    write_set: Vec<WriteEntry>,
    /// Sorted, deduplicated stripe indices; the global acquisition order.
    lock_set: Vec<usize>,
    /// Storage acquired through the transactional allocator; destroyed on
    /// abort, released to the caller on commit.
    alloc_log: Vec<AllocEntry>,
    /// Pointers handed to `free`; retired through EBR on commit, forgotten
    /// on abort.
    free_log: Vec<AllocEntry>,
}

impl Descriptor {
    pub(crate) fn new() -> Self {
        Self {
            read_version: 0,
            read_set: Vec::new(),
            write_set: Vec::new(),
            lock_set: Vec::new(),
            alloc_log: Vec::new(),
            free_log: Vec::new(),
        }
    }

    /// Begin a fresh transaction at read version `rv`.
    pub(crate) fn begin(&mut self, rv: u64) {
        self.reset();
        self.read_version = rv;
    }

    /// Clear every set, keeping capacity. Does not touch the read version.
    pub(crate) fn reset(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.lock_set.clear();
        self.alloc_log.clear();
        self.free_log.clear();
    }

    #[inline]
    pub(crate) fn read_version(&self) -> u64 {
        self.read_version
    }

    pub(crate) fn add_to_read_set(&mut self, var: *const (), validator: Validator) {
        self.read_set.push(ReadEntry { var, validator });
    }

    pub(crate) fn add_to_write_set(
        &mut self,
        var: *const (),
        new_node: *mut (),
        committer: Committer,
        deleter: Destroyer,
    ) {
        self.write_set.push(WriteEntry {
            var,
            new_node,
            committer,
            deleter,
        });
    }

    pub(crate) fn read_set(&self) -> &[ReadEntry] {
        &self.read_set
    }

    pub(crate) fn write_set(&self) -> &[WriteEntry] {
        &self.write_set
    }

    pub(crate) fn write_set_is_empty(&self) -> bool {
        self.write_set.is_empty()
    }

    /// Newest uncommitted write to `var`, if any (read-your-own-writes).
    pub(crate) fn find_own_write(&self, var: *const ()) -> Option<*mut ()> {
        self.write_set
            .iter()
            .rev()
            .find(|entry| entry.var == var)
            .map(|entry| entry.new_node)
    }

    /// Whether this transaction holds the given stripe.
    #[inline]
    pub(crate) fn holds_stripe(&self, index: usize) -> bool {
        self.lock_set.binary_search(&index).is_ok()
    }

    /// Acquire the stripes covering the write set, in ascending index order.
    pub(crate) fn lock_write_set(&mut self) {
        let table = lock_table::table();
        self.lock_set.clear();
        for entry in &self.write_set {
            self.lock_set.push(table.stripe_of(entry.var));
        }
        self.lock_set.sort_unstable();
        self.lock_set.dedup();
        for &index in &self.lock_set {
            table.lock_index(index);
        }
    }

    /// Release held stripes in reverse order.
    pub(crate) fn unlock_write_set(&mut self) {
        let table = lock_table::table();
        for &index in self.lock_set.iter().rev() {
            table.unlock_index(index);
        }
        self.lock_set.clear();
    }

    /// Publish every buffered write at commit timestamp `wv`, draining the
    /// write set so the abort path cannot touch published nodes.
    pub(crate) fn publish_write_set(&mut self, wv: u64) {
        for entry in self.write_set.drain(..) {
            // SAFETY: `var` and `new_node` were captured by the matching
            // typed `store`; the committer is the one it registered.
            unsafe { (entry.committer)(entry.var, entry.new_node, wv) };
        }
    }

    /// Destroy every unpublished draft node (abort path).
    pub(crate) fn rollback_writes(&mut self) {
        for entry in self.write_set.drain(..) {
            // SAFETY: drafts are private to this transaction until commit.
            unsafe { (entry.deleter)(entry.new_node) };
        }
    }

    pub(crate) fn track_allocation(&mut self, ptr: *mut (), destroyer: Destroyer) {
        self.alloc_log.push(AllocEntry { ptr, destroyer });
    }

    pub(crate) fn track_free(&mut self, ptr: *mut (), destroyer: Destroyer) {
        self.free_log.push(AllocEntry { ptr, destroyer });
    }

    /// Commit the allocation logs: allocations now belong to the caller's
    /// structure; freed pointers are retired so concurrent readers can
    /// finish with them.
    pub(crate) fn commit_allocations(&mut self) {
        self.alloc_log.clear();
        for entry in self.free_log.drain(..) {
            // SAFETY: the caller unlinked `ptr` inside a committed
            // transaction, so no new reader can reach it; EBR covers the
            // rest.
            unsafe { petek::retire(entry.ptr, entry.destroyer) };
        }
    }

    /// Roll the allocation logs back: destroy transaction-local allocations,
    /// forget the deferred frees.
    pub(crate) fn rollback_allocations(&mut self) {
        for entry in self.alloc_log.drain(..) {
            // SAFETY: the allocation never escaped a committed transaction.
            unsafe { (entry.destroyer)(entry.ptr) };
        }
        self.free_log.clear();
    }
}

/// Destroys a `Box`-allocated `T`; the `Destroyer` for transactional
/// allocations.
pub(crate) unsafe fn destroy_boxed<T>(ptr: *mut ()) {
    // SAFETY: `ptr` came from `Box::into_raw::<T>` and is destroyed once.
    unsafe { drop(Box::from_raw(ptr as *mut T)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn nop_validator(_var: *const (), _rv: u64) -> bool {
        true
    }

    #[test]
    fn reset_keeps_read_version() {
        let mut desc = Descriptor::new();
        desc.begin(42);
        desc.add_to_read_set(core::ptr::null(), nop_validator);
        desc.reset();
        assert_eq!(desc.read_version(), 42);
        assert!(desc.read_set().is_empty());
        assert!(desc.write_set_is_empty());
    }

    #[test]
    fn own_writes_found_newest_first() {
        let mut desc = Descriptor::new();
        let var = 0x1000 as *const ();
        let first = 0x2000 as *mut ();
        let second = 0x3000 as *mut ();

        unsafe fn nop_committer(_: *const (), _: *mut (), _: u64) {}
        unsafe fn nop_deleter(_: *mut ()) {}

        desc.add_to_write_set(var, first, nop_committer, nop_deleter);
        desc.add_to_write_set(var, second, nop_committer, nop_deleter);
        assert_eq!(desc.find_own_write(var), Some(second));
        // Drain without running deleters on the fake pointers.
        desc.reset();
    }
}
