//! Double-checked memoization of shared instances by key.
//!
//! The fast path takes only the read lock. On a miss the write lock is
//! taken and the key re-checked, so of N concurrent callers for the same
//! key exactly one runs the constructor and all receive the same `Arc`.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::RwLock;

pub struct LazyRegistry<K, V: ?Sized> {
    items: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V: ?Sized> Default for LazyRegistry<K, V> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> LazyRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<Arc<V>> {
        self.items.read().await.get(key).cloned()
    }

    /// Return the instance for `key`, constructing it with `init` if absent.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<V>, E>>,
    {
        if let Some(found) = self.items.read().await.get(&key) {
            return Ok(found.clone());
        }

        let mut items = self.items.write().await;
        // Another task may have built it between the two lookups.
        if let Some(found) = items.get(&key) {
            return Ok(found.clone());
        }
        let created = init().await?;
        items.insert(key, created.clone());
        Ok(created)
    }

    pub async fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.items.write().await.remove(key)
    }

    /// Keep only the entries for which `keep` returns true. Returns how many
    /// were dropped.
    pub async fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &Arc<V>) -> bool,
    {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|k, v| keep(k, v));
        before - items.len()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_construct_once() {
        let registry: Arc<LazyRegistry<String, String>> = Arc::new(LazyRegistry::new());
        let constructed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let constructed = constructed.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_try_init("room".to_string(), || async {
                        constructed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, Infallible>(Arc::new("instance".to_string()))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[tokio::test]
    async fn failed_init_is_not_cached() {
        let registry: LazyRegistry<u32, u32> = LazyRegistry::new();
        let err = registry
            .get_or_try_init(1, || async { Err::<Arc<u32>, _>("nope") })
            .await;
        assert!(err.is_err());
        assert!(registry.get(&1).await.is_none());

        let ok = registry
            .get_or_try_init(1, || async { Ok::<_, &str>(Arc::new(7)) })
            .await
            .unwrap();
        assert_eq!(*ok, 7);
    }

    #[tokio::test]
    async fn retain_reports_dropped() {
        let registry: LazyRegistry<u32, u32> = LazyRegistry::new();
        for i in 0..4 {
            registry
                .get_or_try_init(i, || async move { Ok::<_, Infallible>(Arc::new(i)) })
                .await
                .unwrap();
        }
        assert_eq!(registry.retain(|k, _| k % 2 == 0).await, 2);
        assert_eq!(registry.len().await, 2);
        assert!(registry.remove(&0).await.is_some());
    }
}
