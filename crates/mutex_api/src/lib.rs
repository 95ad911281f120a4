//! A simple mutex API.
//!
//! Code that owns shared state is written against [`Mutex`] so that the same
//! logic runs on a bare-metal [`SpinMutex`] and, with the `std` feature, on
//! [`std::sync::Mutex`] in host tests.
#![cfg_attr(any(not(feature = "std"), target_os = "none"), no_std)]

use core::ops::DerefMut;

pub use self::spin::{SpinMutex, SpinMutexGuard};

mod spin;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    ///
    /// Dropping the guard releases the lock.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    ///
    /// Blocks (or spins) until the lock is acquired.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(all(feature = "std", not(target_os = "none")))]
impl<T> Mutex for std::sync::Mutex<T> {
    type Data = T;
    type Guard<'a>
        = std::sync::MutexGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        // A panic while the lock was held leaves the data as the panicking
        // thread left it; the protected state is still the only copy.
        self.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
