//! Kernel mutex.
//!
//! A [`SpinLock`] is a single lock bit flipped with an atomic exchange. A
//! thread that loses the exchange spins with exponential backoff.
//!
//! An acquisition may carry a holder hint (a thread id), readable with
//! [`SpinLock::holder`] while the guard lives.
#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use crossbeam_utils::Backoff;

/// The holder hint of an acquisition made on nobody's behalf.
pub const NO_HOLDER: i32 = -1;

/// An enumeration of possible errors associated while trying to acquire a lock,
/// from the [`try_lock`] method on a [`SpinLock`].
///
/// [`try_lock`]: SpinLock::try_lock
#[derive(Debug, PartialEq, Eq)]
pub enum TryLockError {
    /// The lock could not be acquired at this time because the operation would
    /// otherwise block.
    WouldBlock,
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The data can only be accessed through the RAII guards returned from
/// [`lock`], [`lock_as`] and [`try_lock`], which
/// guarantees that the data is only ever accessed when the lock is held.
///
/// [`lock`]: Self::lock
/// [`lock_as`]: Self::lock_as
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    holder: AtomicI32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            holder: AtomicI32::new(NO_HOLDER),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    #[inline]
    fn exchange(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn guard(&self, holder: i32) -> SpinLockGuard<'_, T> {
        self.holder.store(holder, Ordering::Relaxed);
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Upon returning, the caller is the only one with the lock held. The lock
    /// is released when the returned guard goes out of scope.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock_as(NO_HOLDER)
    }

    /// Acquires the lock on behalf of `holder`, spinning until it is available.
    pub fn lock_as(&self, holder: i32) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while !self.exchange() {
            backoff.snooze();
        }
        self.guard(holder)
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// # Errors
    ///
    /// If the lock is already held, returns [`TryLockError::WouldBlock`].
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, TryLockError> {
        if self.exchange() {
            Ok(self.guard(NO_HOLDER))
        } else {
            Err(TryLockError::WouldBlock)
        }
    }

    /// The holder hint of the current acquisition, if any.
    pub fn holder(&self) -> Option<i32> {
        match self.holder.load(Ordering::Relaxed) {
            NO_HOLDER => None,
            tid => Some(tid),
        }
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// No locking is needed: the exclusive borrow proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
    }
}
