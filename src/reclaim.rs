//! Thin wrappers around [`seize`] that make the pointer plumbing of the map
//! read like the rest of the crate.
//!
//! Every heap allocation that can be observed by a concurrent reader (chain
//! nodes, values, tables, resize state) is linked to the map's [`Collector`]
//! and freed through deferred reclamation: `retire` marks an allocation as
//! garbage, and `seize` frees it once no active [`Guard`] can still reach it.

pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::{fmt, ptr};

/// An atomic pointer to a collector-linked `T`.
pub(crate) struct Atomic<T>(AtomicPtr<Linked<T>>);

/// A pointer to a collector-linked `T`, valid for the lifetime of the guard
/// it was loaded under.
pub(crate) struct Shared<'g, T> {
    ptr: *mut Linked<T>,
    _g: PhantomData<&'g ()>,
}

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Self(AtomicPtr::default())
    }

    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        guard.protect(&self.0, ordering).into()
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ordering: Ordering) {
        self.0.store(new.ptr, ordering);
    }

    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        ordering: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        self.0.swap(new.ptr, ordering).into()
    }

    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'g, T>,
        success: Ordering,
        failure: Ordering,
        _: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, CompareExchangeError<'g, T>> {
        match self
            .0
            .compare_exchange(current.ptr, new.ptr, success, failure)
        {
            Ok(ptr) => Ok(ptr.into()),
            Err(current) => Err(CompareExchangeError {
                current: current.into(),
                new,
            }),
        }
    }

    /// Converts the pointer to a `Box`.
    ///
    /// # Safety
    ///
    /// This method may be called only if the pointer is valid and nobody else
    /// can reach the same allocation any more.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.0.into_inner()) }
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic(shared.ptr.into())
    }
}

impl<T> Clone for Atomic<T> {
    fn clone(&self) -> Self {
        Atomic(self.0.load(Ordering::Relaxed).into())
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0.load(Ordering::SeqCst))
    }
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    pub(crate) fn as_ptr(&self) -> *mut Linked<T> {
        self.ptr
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Converts the pointer to a `Box`.
    ///
    /// # Safety
    ///
    /// This method may be called only if the pointer is valid and nobody else
    /// is holding a reference to the same allocation.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.ptr) }
    }

    /// Dereference the shared pointer.
    ///
    /// # Safety
    ///
    /// All concerns of dereferencing a shared, raw pointer apply.
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.ptr }
    }
}

impl<'g, T> PartialEq<Shared<'g, T>> for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        Shared::from(self.ptr)
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(ptr: *mut Linked<T>) -> Self {
        Shared {
            ptr,
            _g: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

pub(crate) struct CompareExchangeError<'g, T> {
    pub(crate) current: Shared<'g, T>,
    pub(crate) new: Shared<'g, T>,
}

pub(crate) trait RetireShared {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);
}

impl RetireShared for Guard<'_> {
    /// Retire the allocation, reclaiming it once all outstanding guards that
    /// may have observed it are dropped. Reclamation drops the `T` in place;
    /// note that dropping a chain node does not free the value allocation it
    /// aliases, since nodes hold values by pointer.
    ///
    /// # Safety
    ///
    /// An object may only be retired if it is non-null and no longer
    /// reachable from the map. The current thread may not access it after
    /// this guard is dropped.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.defer_retire(shared.ptr, seize::reclaim::boxed::<Linked<T>>) }
    }
}

/// Get a no-op guard for use when the data structure is not shared.
///
/// # Safety
///
/// Only for use where there cannot be concurrent access to the structure,
/// such as from `Drop` or through `&mut self`.
pub(crate) unsafe fn unprotected() -> Guard<'static> {
    unsafe { Guard::unprotected() }
}
