//! Per-activation mutual exclusion.
//!
//! Read-decide-write sequences on one activation run under that
//! activation's lock; different ids never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of activation id to its async lock.
#[derive(Debug, Default)]
pub struct ActivationLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl ActivationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to activation `id`.
    pub async fn lock(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted activation.
    pub fn forget(&self, id: i64) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = Arc::new(ActivationLocks::new());
        let guard = locks.lock(1).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(2), contender)
            .await
            .expect("contender should acquire the lock once released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = ActivationLocks::new();
        let _first = locks.lock(1).await;
        tokio::time::timeout(Duration::from_secs(1), locks.lock(2))
            .await
            .expect("other ids must not wait");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_removes_entry() {
        let locks = ActivationLocks::new();
        drop(locks.lock(5).await);
        locks.forget(5);
        assert!(locks.is_empty());
    }
}
