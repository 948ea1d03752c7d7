//! The global version clock.
//!
//! A single atomic counter shared by every flavor. `now()` samples the read
//! version at transaction begin; `tick()` mints a commit timestamp. The
//! fetch-add guarantees every commit timestamp exceeds every `now()` value
//! observed before the commit started.

use core::sync::atomic::{AtomicU64, Ordering};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Current clock value.
#[inline]
pub(crate) fn now() -> u64 {
    CLOCK.load(Ordering::SeqCst)
}

/// Advance the clock and return the new, unique value.
#[inline]
pub(crate) fn tick() -> u64 {
    CLOCK.fetch_add(1, Ordering::SeqCst) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let before = now();
        let a = tick();
        let b = tick();
        assert!(a > before);
        assert!(b > a);
        assert!(now() >= b);
    }
}
