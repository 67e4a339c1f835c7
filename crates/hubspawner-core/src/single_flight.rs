//! Per-key async locks whose entries disappear once nobody holds or awaits them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type Table = Arc<DashMap<String, Slot>>;

#[derive(Debug, Default)]
struct Slot {
    lock: Arc<Mutex<()>>,
    /// Holders plus waiters. Only changed under the table's shard lock.
    interested: usize,
}

#[derive(Debug, Default)]
pub struct SingleFlight {
    locks: Table,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Dropping the returned future before it resolves withdraws interest in
    /// `key` like dropping the guard does.
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let lock = {
            let mut slot = self
                .locks
                .entry(key.to_string())
                .or_insert_with(Slot::default);
            slot.interested += 1;
            slot.lock.clone()
        };
        let interest = Interest {
            key: key.to_string(),
            locks: self.locks.clone(),
        };
        trace!(key, "waiting for single-flight lock");
        let guard = lock.lock_owned().await;
        FlightGuard {
            _guard: guard,
            interest,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

struct Interest {
    key: String,
    locks: Table,
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.locks.remove_if_mut(&self.key, |_, slot| {
            slot.interested -= 1;
            slot.interested == 0
        });
    }
}

/// Exclusive access to one key. Fields drop in order, so the lock is
/// released before interest is withdrawn.
pub struct FlightGuard {
    _guard: OwnedMutexGuard<()>,
    interest: Interest,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.interest.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn table_prunes_after_release() {
        let flights = SingleFlight::new();
        {
            let guard = flights.acquire("hub-alice").await;
            assert_eq!(guard.key(), "hub-alice");
            assert_eq!(flights.len(), 1);
        }
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let flights = Arc::new(SingleFlight::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = flights.acquire("hub-bob").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_no_entry() {
        let flights = SingleFlight::new();
        let holder = flights.acquire("hub-carol").await;
        let waited =
            tokio::time::timeout(Duration::from_millis(20), flights.acquire("hub-carol")).await;
        assert!(waited.is_err());
        assert_eq!(flights.len(), 1);
        drop(holder);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn aborted_waiter_after_release_leaves_no_entry() {
        let flights = Arc::new(SingleFlight::new());
        let holder = flights.acquire("hub-dave").await;
        let waiter = {
            let flights = flights.clone();
            tokio::spawn(async move {
                let _guard = flights.acquire("hub-dave").await;
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(holder);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let flights = SingleFlight::new();
        let _a = flights.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), flights.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(flights.len(), 2);
    }
}
