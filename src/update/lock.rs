//! Per-binary serialization of library mutations.

use crate::update::Binary;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Serializes all mutating operations on a binary's library directory
/// within a single process.
///
/// Constructed once at core initialization and passed explicitly; there is
/// no process-global registry. Locks for different binaries are
/// independent. Holders must not re-acquire the lock they already hold.
#[derive(Debug, Default)]
pub struct LibraryLock {
    launcher: Mutex<()>,
    osqueryd: Mutex<()>,
}

impl LibraryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for the given binary, blocking until it is free.
    ///
    /// The returned guard releases on drop, so the lock is freed on every
    /// exit path including panics and early returns.
    pub fn lock(&self, binary: Binary) -> MutexGuard<'_, ()> {
        let mutex = match binary {
            Binary::Launcher => &self.launcher,
            Binary::Osqueryd => &self.osqueryd,
        };
        // A poisoned lock only means another holder panicked; the guarded
        // directory state is reconciled by tidy, not by the lock itself.
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
