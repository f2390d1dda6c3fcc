// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Simulated interrupt request levels.
//!
//! Each thread has a current level, starting at [`Irql::PASSIVE`]. Locks that
//! must not be preempted raise it for as long as they are held.

use std::cell::Cell;
use std::fmt;

/// An interrupt request level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Irql(pub u8);

#[expect(missing_docs)] // Named after the kernel levels.
impl Irql {
    pub const PASSIVE: Self = Self(0);
    pub const APC: Self = Self(1);
    pub const DISPATCH: Self = Self(2);
    pub const SYNCH: Self = Self(12);
}

impl fmt::Display for Irql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PASSIVE => f.write_str("PASSIVE_LEVEL"),
            Self::APC => f.write_str("APC_LEVEL"),
            Self::DISPATCH => f.write_str("DISPATCH_LEVEL"),
            Self::SYNCH => f.write_str("SYNCH_LEVEL"),
            Self(level) => write!(f, "IRQL {level}"),
        }
    }
}

thread_local! {
    static CURRENT: Cell<Irql> = const { Cell::new(Irql::PASSIVE) };
}

/// The calling thread's level.
pub fn current() -> Irql {
    CURRENT.with(|current| current.get())
}

/// Raises the calling thread to `level` and returns the previous level.
/// Raising to a lower level leaves the level unchanged.
pub fn raise(level: Irql) -> Irql {
    CURRENT.with(|current| {
        let previous = current.get();
        if level < previous {
            tracing::error!(%previous, %level, "attempt to raise to a lower IRQL");
        } else {
            current.set(level);
        }
        previous
    })
}

/// Lowers the calling thread to `level`. Lowering to a higher level leaves
/// the level unchanged.
pub fn lower(level: Irql) {
    CURRENT.with(|current| {
        let previous = current.get();
        if level > previous {
            tracing::error!(%previous, %level, "attempt to lower to a higher IRQL");
        } else {
            current.set(level);
        }
    })
}

/// Sets the calling thread's level unconditionally. Used to repair the level
/// after test code left it changed.
pub(crate) fn restore(level: Irql) {
    CURRENT.with(|current| current.set(level));
}

/// Raises the level until dropped.
#[must_use]
pub struct RaisedIrql {
    previous: Irql,
}

/// Raises the calling thread to `level` for the lifetime of the returned
/// guard.
pub fn raise_scoped(level: Irql) -> RaisedIrql {
    RaisedIrql {
        previous: raise(level),
    }
}

impl Drop for RaisedIrql {
    fn drop(&mut self) {
        lower(self.previous);
    }
}

/// A spin lock that is held at [`Irql::SYNCH`].
pub struct IrqlSpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Guard of an [`IrqlSpinLock`].
pub struct IrqlSpinLockGuard<'a, T> {
    // Field order matters: the lock is released before the level drops.
    guard: spin::MutexGuard<'a, T>,
    _irql: RaisedIrql,
}

impl<T> IrqlSpinLock<T> {
    /// Creates an unlocked spin lock holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Raises the thread to [`Irql::SYNCH`] and spins until the lock is
    /// acquired.
    pub fn lock(&self) -> IrqlSpinLockGuard<'_, T> {
        let irql = raise_scoped(Irql::SYNCH);
        IrqlSpinLockGuard {
            guard: self.inner.lock(),
            _irql: irql,
        }
    }
}

impl<T: Default> Default for IrqlSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::ops::Deref for IrqlSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for IrqlSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_raise_restores() {
        assert_eq!(current(), Irql::PASSIVE);
        {
            let _raised = raise_scoped(Irql::DISPATCH);
            assert_eq!(current(), Irql::DISPATCH);
            let _nested = raise_scoped(Irql::SYNCH);
            assert_eq!(current(), Irql::SYNCH);
        }
        assert_eq!(current(), Irql::PASSIVE);
    }

    #[test]
    fn invalid_transitions_are_ignored() {
        let previous = raise(Irql::DISPATCH);
        assert_eq!(previous, Irql::PASSIVE);
        raise(Irql::APC);
        assert_eq!(current(), Irql::DISPATCH);
        lower(Irql::SYNCH);
        assert_eq!(current(), Irql::DISPATCH);
        lower(Irql::PASSIVE);
        assert_eq!(current(), Irql::PASSIVE);
    }

    #[test]
    fn spin_lock_raises_while_held() {
        let lock = IrqlSpinLock::new(5);
        {
            let mut value = lock.lock();
            assert_eq!(current(), Irql::SYNCH);
            *value += 1;
        }
        assert_eq!(current(), Irql::PASSIVE);
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn display() {
        assert_eq!(Irql::DISPATCH.to_string(), "DISPATCH_LEVEL");
        assert_eq!(Irql(5).to_string(), "IRQL 5");
    }
}
