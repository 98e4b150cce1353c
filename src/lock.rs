//! Poison-tolerant guards for the in-memory key registry, sealed entries
//! and policy engines. Guards are never held across an `.await`.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared guard on an RwLock, taken over from a panicked writer if needed.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("RwLock was poisoned, recovering read guard");
        poisoned.into_inner()
    })
}

/// Exclusive guard on an RwLock, taken over from a panicked writer if needed.
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("RwLock was poisoned, recovering write guard");
        poisoned.into_inner()
    })
}

/// Guard on a Mutex, taken over from a panicked holder if needed.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Mutex was poisoned, recovering guard");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_write_roundtrip() {
        let lock_ = RwLock::new(1);
        *write_lock(&lock_) += 1;
        assert_eq!(*read_lock(&lock_), 2);
    }

    #[test]
    fn test_poisoned_rwlock_keeps_last_write() {
        let registry = Arc::new(RwLock::new(vec!["a/signing/epoch-0"]));
        let r = Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let mut guard = r.write().unwrap();
            guard.push("a/signing/epoch-1");
            panic!("poison");
        })
        .join();
        assert!(registry.is_poisoned());
        assert_eq!(read_lock(&registry).len(), 2);
        write_lock(&registry).clear();
        assert!(read_lock(&registry).is_empty());
    }

    #[test]
    fn test_poisoned_mutex_recovers() {
        let mutex = Arc::new(Mutex::new(5));
        let m = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = m.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 5);
    }
}
