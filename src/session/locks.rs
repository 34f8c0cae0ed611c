//! Per-message write exclusion

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async locks keyed by message ID.
///
/// Every write to a message row holds its lock, so writes for one message
/// never interleave.
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl MessageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to a message
    pub async fn lock(&self, message_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(message_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a finalized message
    pub fn forget(&self, message_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(message_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = MessageLocks::new();
        let guard = locks.lock("m1").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.lock("m1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Other messages are unaffected
        let _other = locks.lock("m2").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_removes_entry() {
        let locks = MessageLocks::new();
        drop(locks.lock("m1").await);
        assert_eq!(locks.len(), 1);
        locks.forget("m1");
        assert_eq!(locks.len(), 0);
    }
}
