use moka::future::Cache;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Async mutex per key, kept in an idle-expiring cache so the table does not
/// grow with every lead ever seen.
///
/// An entry idle for longer than `idle` may be evicted while a guard on it is
/// still alive; lead writes are additionally version-checked by the store, so
/// such a holder would fail with a conflict instead of overwriting.
#[derive(Clone)]
pub struct KeyedLocks<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    locks: Cache<K, Arc<Mutex<()>>>,
}

impl<K> KeyedLocks<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(idle: Duration) -> Self {
        Self {
            locks: Cache::builder()
                .time_to_idle(idle)
                .max_capacity(100_000)
                .build(),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .get_with(key, async { Arc::new(Mutex::new(())) })
            .await;
        mutex.lock_owned().await
    }
}

/// Single-writer discipline for per-lead operations.
pub type LeadLocks = KeyedLocks<Uuid>;

impl Default for KeyedLocks<Uuid> {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = LeadLocks::default();
        let id = Uuid::new_v4();
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(id).await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = LeadLocks::default();
        let _first = locks.lock(Uuid::new_v4()).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4()))
            .await;
        assert!(second.is_ok());
    }
}
