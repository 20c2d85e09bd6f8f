use std::sync::{Mutex, MutexGuard, TryLockError};

/// Attempts to lock the given mutex.
///
/// Returns the guard even if the mutex is poisoned: a panic on one real-time
/// thread must not cascade into every other thread touching the same data
/// structure being unable to proceed.
///
/// # Panics
///
/// Panics if the mutex is already locked. Every lock this is used on is only
/// ever held for the duration of a short, non-blocking critical section (a
/// slice push/pop, a flag flip), so contention means a bug, not bad luck.
pub fn non_blocking_lock<'a, T>(mutex: &'a Mutex<T>, description: &'static str) -> MutexGuard<'a, T> {
    match mutex.try_lock() {
        Ok(g) => g,
        Err(TryLockError::Poisoned(e)) => e.into_inner(),
        Err(TryLockError::WouldBlock) => panic!("locking mutex would block: {}", description),
    }
}
