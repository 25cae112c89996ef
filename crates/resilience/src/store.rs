//! Shared atomic counter storage.
//!
//! Rate budgets and circuit-breaker state must be visible to every worker
//! processing the same remote account, so they live behind this trait
//! instead of in-process statics. Deployments with a single process can use
//! [`MemoryCounterStore`]; multi-worker deployments implement the trait
//! over a shared cache or database that supports atomic increments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Atomic counter operations shared across workers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `amount` (which may be negative) to the counter at
    /// `key`, creating it at zero first, and return the new value.
    async fn increment(&self, key: &str, amount: i64) -> anyhow::Result<i64>;

    /// Read a counter. Returns `None` for absent or expired keys.
    async fn get(&self, key: &str) -> anyhow::Result<Option<i64>>;

    /// Overwrite a counter unconditionally.
    async fn set(&self, key: &str, value: i64) -> anyhow::Result<()>;

    /// Overwrite a counter and expire it after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()>;

    /// Remove a counter.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-process [`CounterStore`] backed by a mutex-guarded map with lazy
/// expiry. Suitable for single-worker deployments and tests.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, amount: i64) -> anyhow::Result<i64> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.live() {
            entry.value = 0;
            entry.expires_at = None;
        }
        entry.value += amount;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).filter(|e| e.live()).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn increment_creates_and_accumulates() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("a", 3).await.unwrap(), 3);
        assert_eq!(store.increment("a", 2).await.unwrap(), 5);
        assert_eq!(store.increment("a", -5).await.unwrap(), 0);
        assert_eq!(store.get("a").await.unwrap(), Some(0));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_entries_expire() {
        let store = MemoryCounterStore::new();
        store
            .set_with_ttl("t", 7, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("t").await.unwrap(), Some(7));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("t").await.unwrap(), None);
        // Incrementing an expired key restarts from zero.
        assert_eq!(store.increment("t", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_entries() {
        let store = MemoryCounterStore::new();
        store.set("d", 1).await.unwrap();
        store.delete("d").await.unwrap();
        assert_eq!(store.get("d").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_increments_do_not_lose_updates() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.increment("c", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("c").await.unwrap(), Some(800));
    }
}
