//! Lock acquisition with poison recovery.
//!
//! A panic inside a critical section poisons the lock. Every structure
//! guarded here (alias maps, flight maps, idle lists) stays consistent across
//! a panic, so the inner value is recovered and a warning is logged instead
//! of cascading the panic into unrelated callers.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquires a mutex, recovering from poison.
pub(crate) fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Mutex was poisoned, recovering");
            metrics::counter!("lock_poison_recovery_total", "kind" => "mutex").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Acquires a read lock, recovering from poison.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("RwLock was poisoned, recovering read guard");
            metrics::counter!("lock_poison_recovery_total", "kind" => "read").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Acquires a write lock, recovering from poison.
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("RwLock was poisoned, recovering write guard");
            metrics::counter!("lock_poison_recovery_total", "kind" => "write").increment(1);
            poisoned.into_inner()
        },
    }
}
