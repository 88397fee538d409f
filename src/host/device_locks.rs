use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use crate::model::DeviceId;

type DeviceLock = Arc<tokio::sync::Mutex<()>>;
type LockMap = Arc<Mutex<HashMap<DeviceId, DeviceLock>>>;

/// One async mutex per device id. Operations on the same device run one at
/// a time, operations on different devices do not wait for each other.
///
/// An entry lives only while someone holds or waits for it.
#[derive(Clone, Default)]
pub struct DeviceLocks {
    locks: LockMap,
}

/// Exclusive access to one device. Releasing the last guard of an id
/// forgets its lock.
pub struct DeviceGuard {
    id: DeviceId,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

fn lock_map(locks: &LockMap) -> MutexGuard<'_, HashMap<DeviceId, DeviceLock>> {
    locks.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &str) -> DeviceGuard {
        let lock =
            lock_map(&self.locks).entry(id.to_string()).or_default().clone();

        DeviceGuard {
            id: id.to_string(),
            locks: self.locks.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of ids currently locked or waited for.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        // Release first so the map holds the only other reference.
        self.guard.take();

        let mut locks = lock_map(&self.locks);
        let idle = locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_device_is_exclusive() {
        let locks = DeviceLocks::new();

        let guard = locks.lock("a").await;
        let second = timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(second.is_err());

        drop(guard);
        let second = timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_different_devices_do_not_wait() {
        let locks = DeviceLocks::new();

        let _a = locks.lock("a").await;
        let b = timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let locks = DeviceLocks::new();

        for i in 0..1000 {
            drop(locks.lock(&format!("unknown-{}", i)).await);
        }
        assert!(locks.is_empty());

        let held = locks.lock("a").await;
        drop(locks.lock("b").await);
        assert_eq!(locks.len(), 1);

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_the_lock_alive() {
        let locks = DeviceLocks::new();

        let held = locks.lock("a").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock("a").await })
        };
        tokio::task::yield_now().await;

        // The waiter's reference keeps the entry after the holder leaves.
        drop(held);
        let second = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.len(), 1);

        drop(second);
        assert!(locks.is_empty());
    }
}
