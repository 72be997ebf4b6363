//! Keyed async mutex table.
//!
//! The registry lock is only held to find or create an entry and adjust its
//! waiter count; the per-key mutex is awaited outside of it. Entries are
//! removed once the last holder or waiter goes away, including waiters whose
//! acquisition future was dropped before it completed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    waiters: usize,
}

type Registry = Arc<Mutex<HashMap<String, Entry>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<String, Entry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts one waiter or holder against a key for as long as it lives.
struct Registration {
    registry: Registry,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = lock_registry(&self.registry);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Held while a key is locked. Dropping it releases the key.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

#[derive(Clone, Default)]
pub struct LockManager {
    registry: Registry,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let (lock, registration) = {
            let mut entries = lock_registry(&self.registry);
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                waiters: 0,
            });
            entry.waiters += 1;
            let registration = Registration {
                registry: Arc::clone(&self.registry),
                key: key.to_string(),
            };
            (Arc::clone(&entry.lock), registration)
        };

        let guard = lock.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Non-blocking probe: is someone holding `key` right now?
    pub fn is_locked(&self, key: &str) -> bool {
        lock_registry(&self.registry)
            .get(key)
            .map(|entry| entry.lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys with at least one holder or waiter.
    pub fn active_keys(&self) -> usize {
        lock_registry(&self.registry).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = LockManager::new();
        let guard = locks.acquire("spotify_a").await;
        assert!(locks.is_locked("spotify_a"));
        assert_eq!(locks.active_keys(), 1);

        drop(guard);
        assert!(!locks.is_locked("spotify_a"));
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_locked() {
        let locks = LockManager::new();
        assert!(!locks.is_locked("deezer_1"));
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_cleaned_up() {
        let locks = LockManager::new();
        let guard = locks.acquire("k").await;

        let waited = tokio::time::timeout(Duration::from_millis(20), locks.acquire("k")).await;
        assert!(waited.is_err());
        assert_eq!(locks.active_keys(), 1);

        drop(guard);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = LockManager::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = LockManager::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }
}
