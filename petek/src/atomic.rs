//! Guard-protected atomic pointers.
//!
//! [`Atomic<T>`] is an atomic pointer whose loads are tied to a [`Guard`]
//! lifetime: the returned [`Shared<'g, T>`] cannot outlive the critical
//! section that made it safe to dereference.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::guard::Guard;

/// An atomic pointer to a heap-allocated value.
///
/// Loads require a [`Guard`] and yield a [`Shared`] bounded by its lifetime.
/// Reclamation of displaced pointers is the caller's business, normally via
/// [`crate::retire`].
pub struct Atomic<T> {
    data: AtomicPtr<T>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Creates an atomic pointer holding `ptr`.
    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        Self {
            data: AtomicPtr::new(ptr),
            _marker: PhantomData,
        }
    }

    /// Creates a null atomic pointer.
    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Loads the pointer under the protection of `guard`.
    #[inline]
    pub fn load<'g>(&self, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            data: self.data.load(order),
            _marker: PhantomData,
        }
    }

    /// Loads the pointer without a guard.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the pointee's lifetime: for
    /// example inside a deleter, a destructor, or while holding a lock that
    /// excludes every writer.
    #[inline]
    pub unsafe fn load_unprotected(&self, order: Ordering) -> *mut T {
        self.data.load(order)
    }

    /// Stores a new pointer.
    #[inline]
    pub fn store(&self, new: Shared<'_, T>, order: Ordering) {
        self.data.store(new.data, order);
    }

    /// Swaps the pointer, returning the previous value.
    #[inline]
    pub fn swap<'g>(&self, new: Shared<'_, T>, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            data: self.data.swap(new.data, order),
            _marker: PhantomData,
        }
    }

    /// Compare-and-exchange.
    #[inline]
    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        match self
            .data
            .compare_exchange(current.data, new.data, success, failure)
        {
            Ok(prev) => Ok(Shared {
                data: prev,
                _marker: PhantomData,
            }),
            Err(prev) => Err(Shared {
                data: prev,
                _marker: PhantomData,
            }),
        }
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

/// A pointer valid for the lifetime of the guard that loaded it.
pub struct Shared<'g, T> {
    data: *mut T,
    _marker: PhantomData<(&'g Guard, *mut T)>,
}

impl<'g, T> Shared<'g, T> {
    /// Wraps a raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer must stay valid for `'g`: either it is protected by the
    /// guard the lifetime is borrowed from, or the caller owns it outright.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            data: ptr,
            _marker: PhantomData,
        }
    }

    /// The null shared pointer.
    #[inline]
    pub fn null() -> Self {
        Self {
            data: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Returns the raw pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.data
    }

    /// Whether the pointer is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    /// Converts to an optional reference.
    ///
    /// # Safety
    ///
    /// Non-null pointers must point to a valid, initialised `T`.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&'g T> {
        // SAFETY: caller guarantees validity; the guard keeps it alive.
        unsafe { self.data.as_ref() }
    }

    /// Converts to a reference without the null check.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and valid.
    #[inline]
    pub unsafe fn deref(&self) -> &'g T {
        // SAFETY: caller guarantees a non-null, valid pointer.
        unsafe { &*self.data }
    }
}

impl<'g, T> Clone for Shared<'g, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, T> Copy for Shared<'g, T> {}

impl<'g, T> PartialEq for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<'g, T> Eq for Shared<'g, T> {}

impl<'g, T> core::fmt::Debug for Shared<'g, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Shared({:p})", self.data)
    }
}
