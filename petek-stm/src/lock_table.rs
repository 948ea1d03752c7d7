//! The striped lock table used by the OCC flavors at commit time.
//!
//! A fixed power-of-two array of cache-padded TTAS flags. Many variable
//! addresses share one stripe; a hash collision costs false contention,
//! never correctness. The table is not recursive; callers sort and
//! deduplicate stripe indices before locking, which also yields a global
//! acquisition order and rules out deadlock.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};
use std::hash::BuildHasher;

use crossbeam_utils::CachePadded;
use foldhash::fast::FixedState;
use once_cell::sync::Lazy;

/// Number of lock stripes. Power of two.
pub const TABLE_SIZE: usize = 1 << 20;

const TABLE_MASK: usize = TABLE_SIZE - 1;

/// Stable seed so stripe assignment is deterministic within a process.
const STRIPE_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

pub(crate) struct StripedLockTable {
    stripes: Box<[CachePadded<AtomicBool>]>,
}

static TABLE: Lazy<StripedLockTable> = Lazy::new(StripedLockTable::new);

/// The process-wide lock table.
#[inline]
pub(crate) fn table() -> &'static StripedLockTable {
    &TABLE
}

impl StripedLockTable {
    fn new() -> Self {
        let stripes = (0..TABLE_SIZE)
            .map(|_| CachePadded::new(AtomicBool::new(false)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes }
    }

    /// Stripe index for a variable address.
    #[inline]
    pub(crate) fn stripe_of(&self, addr: *const ()) -> usize {
        FixedState::with_seed(STRIPE_SEED).hash_one(addr as usize) as usize & TABLE_MASK
    }

    /// Spin until the stripe is acquired. TTAS: test on a relaxed load so
    /// the spin stays in cache, yield when the exchange keeps failing.
    pub(crate) fn lock_index(&self, index: usize) {
        let flag = &self.stripes[index];
        loop {
            if flag.load(Ordering::Relaxed) {
                spin_loop();
                continue;
            }
            if !flag.swap(true, Ordering::Acquire) {
                return;
            }
            std::thread::yield_now();
        }
    }

    #[inline]
    pub(crate) fn unlock_index(&self, index: usize) {
        self.stripes[index].store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_locked_index(&self, index: usize) -> bool {
        self.stripes[index].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_locked(&self, addr: *const ()) -> bool {
        self.is_locked_index(self.stripe_of(addr))
    }
}
