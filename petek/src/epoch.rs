//! Global epoch state: the epoch counter, the participant registry and the
//! orphan queue for buckets abandoned by exiting threads.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::bag::Bag;
use crate::participant::Participant;

/// Process-wide epoch state.
pub(crate) struct EpochState {
    /// Monotonic epoch counter. Bucket index is `epoch % 3`, which realises
    /// the three-epoch scheme without ever wrapping the comparison logic.
    epoch: CachePadded<AtomicU64>,
    registry: Registry,
    /// Buckets abandoned by exited threads, one list per epoch residue.
    orphans: [OrphanList; 3],
}

pub(crate) static STATE: EpochState = EpochState::new();

impl EpochState {
    const fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicU64::new(0)),
            registry: Registry::new(),
            orphans: [OrphanList::new(), OrphanList::new(), OrphanList::new()],
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn global_epoch_word(&self) -> &AtomicU64 {
        &self.epoch
    }

    pub(crate) fn enroll(&self) -> &'static Participant {
        self.registry.enroll()
    }

    /// Try to move the global epoch one step forward.
    ///
    /// Succeeds only when every pinned participant has published the current
    /// epoch. Returns the new epoch on success.
    pub(crate) fn try_advance(&self) -> Option<u64> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        let mut node = self.registry.head.load(Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: registry nodes are never freed.
            let participant = unsafe { &*node };
            if participant.is_pinned()
                && participant.local_epoch.load(Ordering::SeqCst) != epoch
            {
                return None;
            }
            node = participant.next.load(Ordering::Acquire);
        }

        // Order the registry scan before the CAS.
        fence(Ordering::Acquire);
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        Some(epoch + 1)
    }

    /// Hand a non-empty bucket over to the orphan queue (thread exit path).
    pub(crate) fn adopt(&self, bag: Bag) {
        let idx = (bag.epoch % 3) as usize;
        self.orphans[idx].push(bag);
    }

    /// Free every orphaned bucket whose epoch is quiescent under `current`.
    pub(crate) fn drain_orphans(&self, current: u64) {
        for list in &self.orphans {
            let mut expired = list.take_expired(current);
            for bag in &mut expired {
                // SAFETY: `bag.epoch + 2 <= current`, so every reader that
                // could have observed these objects has unpinned.
                unsafe { bag.free_all() };
            }
        }
    }
}

/// Intrusive lock-free list of participants.
///
/// Nodes are pushed with a CAS loop and never removed; an exiting thread
/// marks its node inactive and a later thread may claim it, so the list
/// length is bounded by the peak number of concurrent threads.
struct Registry {
    head: AtomicPtr<Participant>,
}

impl Registry {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn enroll(&self) -> &'static Participant {
        // First pass: claim an inactive node left behind by an exited thread.
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: registry nodes are never freed.
            let participant = unsafe { &*node };
            if !participant.active.load(Ordering::Relaxed)
                && participant
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return participant;
            }
            node = participant.next.load(Ordering::Acquire);
        }

        // No reusable node: push a fresh one.
        let fresh: &'static Participant = Box::leak(Box::new(Participant::new()));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            fresh.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                fresh as *const _ as *mut _,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return fresh,
                Err(observed) => head = observed,
            }
        }
    }
}

/// A spin-locked list of orphaned buckets for one epoch residue.
struct OrphanList {
    locked: AtomicBool,
    bags: UnsafeCell<Vec<Bag>>,
}

// The spinlock serialises all access to `bags`.
unsafe impl Sync for OrphanList {}

impl OrphanList {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            bags: UnsafeCell::new(Vec::new()),
        }
    }

    fn acquire(&self) {
        loop {
            // Test before test-and-set so the spin stays in cache.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn push(&self, bag: Bag) {
        self.acquire();
        // SAFETY: the spinlock is held.
        unsafe { (*self.bags.get()).push(bag) };
        self.release();
    }

    /// Remove and return every bag with `epoch + 2 <= current`.
    fn take_expired(&self, current: u64) -> Vec<Bag> {
        let mut expired = Vec::new();
        self.acquire();
        // SAFETY: the spinlock is held.
        let bags = unsafe { &mut *self.bags.get() };
        let mut i = 0;
        while i < bags.len() {
            if bags[i].epoch + 2 <= current {
                expired.push(bags.swap_remove(i));
            } else {
                i += 1;
            }
        }
        self.release();
        expired
    }
}
