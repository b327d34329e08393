//! Storage for a handle parked in a slot.
//!
//! Only the current owner of a slot touches its cell, so access is already
//! serialized by the owner CAS. The mutex is never waited on: every access is a
//! `try_lock`, and contention means a caller broke the one-token-one-caller rule.

use std::sync::{Mutex, TryLockError};

pub(crate) struct SlotCell<T> {
    inner: Mutex<Option<T>>,
}

impl<T> SlotCell<T> {
    pub(crate) const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.with(Option::take).flatten()
    }

    /// Park a value. Hands it back if the cell is contended.
    pub(crate) fn put(&self, value: T) -> Result<(), T> {
        match self.inner.try_lock() {
            Ok(mut guard) => {
                *guard = Some(value);
                Ok(())
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                *poisoned.into_inner() = Some(value);
                Ok(())
            }
            Err(TryLockError::WouldBlock) => {
                tracing::error!("Slot cell contended - token shared between concurrent callers");
                Err(value)
            }
        }
    }

    fn with<U>(&self, f: impl FnOnce(&mut Option<T>) -> U) -> Option<U> {
        match self.inner.try_lock() {
            Ok(mut guard) => Some(f(&mut guard)),
            Err(TryLockError::Poisoned(poisoned)) => Some(f(&mut poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => {
                tracing::error!("Slot cell contended - token shared between concurrent callers");
                None
            }
        }
    }
}

impl<T: Clone> SlotCell<T> {
    pub(crate) fn cloned(&self) -> Option<T> {
        self.with(|slot| slot.clone()).flatten()
    }
}
