// Time-bounded derived views over the dictionary stores.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use easel_store::{BannedWordStore, DomainStore};
use easel_types::{BannedWordSet, DomainTag};

use crate::error::Result;

struct Cached<T> {
    built_at: Instant,
    value: Vec<T>,
}

/// Derived view of the enabled domain keyword sets, rebuilt lazily after
/// the absolute TTL or an explicit clear.
pub struct DomainCache {
    store: Arc<dyn DomainStore>,
    ttl: Duration,
    inner: RwLock<Option<Cached<DomainTag>>>,
}

impl DomainCache {
    pub fn new(store: Arc<dyn DomainStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Result<Vec<DomainTag>> {
        {
            let inner = self.inner.read().await;
            if let Some(cached) = inner.as_ref() {
                if cached.built_at.elapsed() < self.ttl {
                    return Ok(cached.value.clone());
                }
            }
        }
        let mut inner = self.inner.write().await;
        // Another reader may have rebuilt while we waited for the lock.
        if let Some(cached) = inner.as_ref() {
            if cached.built_at.elapsed() < self.ttl {
                return Ok(cached.value.clone());
            }
        }
        let value = self.store.list_enabled().await?;
        *inner = Some(Cached {
            built_at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

/// Derived view of the enabled banned-word sets.
pub struct BannedWordCache {
    store: Arc<dyn BannedWordStore>,
    ttl: Duration,
    inner: RwLock<Option<Cached<BannedWordSet>>>,
}

impl BannedWordCache {
    pub fn new(store: Arc<dyn BannedWordStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Result<Vec<BannedWordSet>> {
        {
            let inner = self.inner.read().await;
            if let Some(cached) = inner.as_ref() {
                if cached.built_at.elapsed() < self.ttl {
                    return Ok(cached.value.clone());
                }
            }
        }
        let mut inner = self.inner.write().await;
        if let Some(cached) = inner.as_ref() {
            if cached.built_at.elapsed() < self.ttl {
                return Ok(cached.value.clone());
            }
        }
        let value = self.store.list_enabled().await?;
        *inner = Some(Cached {
            built_at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use easel_store::MemoryDomainStore;

    #[tokio::test]
    async fn serves_cached_until_cleared() {
        let store = MemoryDomainStore::new(vec![DomainTag::new(
            "anime",
            vec!["waifu".to_string()],
        )]);
        let cache = DomainCache::new(Arc::new(store.clone()), Duration::from_secs(1800));

        assert_eq!(cache.get().await.unwrap().len(), 1);

        // A dictionary change is invisible until eviction.
        store.replace(Vec::new());
        assert_eq!(cache.get().await.unwrap().len(), 1);

        cache.clear().await;
        assert!(cache.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let store = MemoryDomainStore::new(vec![DomainTag::new(
            "anime",
            vec!["waifu".to_string()],
        )]);
        let cache = DomainCache::new(Arc::new(store.clone()), Duration::from_millis(10));

        assert_eq!(cache.get().await.unwrap().len(), 1);
        store.replace(Vec::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get().await.unwrap().is_empty());
    }
}
