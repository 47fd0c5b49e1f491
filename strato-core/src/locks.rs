//! Per-entity lock map.
//!
//! Mutations to a given host, VM, or the policy binding set must be serialized
//! without a global lock over the whole inventory. The lock map hands out one
//! async mutex per entity key; callers for different entities never contend.
//!
//! Locks must not be held across agent I/O. The dispatch pattern is: validate
//! and reserve intent under the lock, release it, perform the remote call,
//! then reacquire to commit or roll back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of entity key to its serialization mutex.
#[derive(Default)]
pub struct LockMap {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a single entity key.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Acquire locks for several entity keys in a deadlock-free order.
    ///
    /// Keys are sorted before acquisition so that concurrent callers touching
    /// overlapping entity sets always lock in the same global order.
    pub async fn lock_many(&self, keys: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.entry(key).lock_owned().await);
        }
        guards
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("lock map poisoned");
        map.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// Lock key for a host entity.
pub fn host_key(host_id: &str) -> String {
    format!("host:{}", host_id)
}

/// Lock key for a VM entity.
pub fn vm_key(vm_id: &str) -> String {
    format!("vm:{}", vm_id)
}

/// Lock key for a task entity.
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// Lock key serializing all policy binding mutations.
pub const POLICY_BINDINGS_KEY: &str = "policy-bindings";

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(LockMap::new());
        let counter = Arc::new(AsyncMutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("host:h1").await;
                let mut count = counter.lock().await;
                *count += 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock().await, 8);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = LockMap::new();
        let _a = locks.lock("host:a").await;
        // Must not deadlock: different entity.
        let acquired = tokio::time::timeout(Duration::from_millis(100), locks.lock("host:b")).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_lock_many_orders_keys() {
        let locks = Arc::new(LockMap::new());

        // Two tasks locking the same pair in opposite order must not deadlock.
        let l1 = locks.clone();
        let t1 = tokio::spawn(async move {
            for _ in 0..50 {
                let _guards = l1.lock_many(&["host:a", "host:b"]).await;
            }
        });
        let l2 = locks.clone();
        let t2 = tokio::spawn(async move {
            for _ in 0..50 {
                let _guards = l2.lock_many(&["host:b", "host:a"]).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            t1.await.unwrap();
            t2.await.unwrap();
        })
        .await
        .expect("lock_many deadlocked");
    }
}
