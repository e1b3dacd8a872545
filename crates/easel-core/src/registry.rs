// Account registry.
// In-memory view of account instances with a TTL'd sub-channel reverse
// map and the round-robin counter for the Polling selection rule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::{Duration, Instant};

use easel_types::Account;

use crate::instance::UpstreamInstance;

const SUB_CHANNEL_TTL: Duration = Duration::from_secs(30 * 60);

struct SubChannelView {
    built_at: Instant,
    generation: u64,
    map: HashMap<String, String>,
}

#[derive(Default)]
pub struct AccountRegistry {
    instances: RwLock<HashMap<String, Arc<UpstreamInstance>>>,
    /// Bumped on every account mutation; invalidates the derived view.
    generation: AtomicU64,
    sub_channel_view: Mutex<Option<SubChannelView>>,
    poll_counter: AtomicUsize,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: Arc<UpstreamInstance>) {
        self.instances
            .write()
            .insert(instance.channel_id(), instance);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove and shut down an instance.
    pub fn remove(&self, channel_id: &str) -> Option<Arc<UpstreamInstance>> {
        let removed = self.instances.write().remove(channel_id);
        if let Some(instance) = &removed {
            instance.shutdown();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Apply an out-of-band account mutation.
    pub fn update_account(&self, account: Account) -> bool {
        let instances = self.instances.read();
        let Some(instance) = instances.get(&account.channel_id) else {
            return false;
        };
        instance.update_account(account);
        drop(instances);
        self.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn all(&self) -> Vec<Arc<UpstreamInstance>> {
        self.instances.read().values().cloned().collect()
    }

    pub fn alive(&self) -> Vec<Arc<UpstreamInstance>> {
        self.instances
            .read()
            .values()
            .filter(|i| i.is_alive())
            .cloned()
            .collect()
    }

    pub fn by_channel(&self, channel_id: &str) -> Option<Arc<UpstreamInstance>> {
        self.instances.read().get(channel_id).cloned()
    }

    /// Resolve a sub channel to its owning instance through the TTL'd
    /// reverse map.
    pub fn by_sub_channel(&self, sub_channel_id: &str) -> Option<Arc<UpstreamInstance>> {
        let channel_id = {
            let mut view = self.sub_channel_view.lock();
            let generation = self.generation.load(Ordering::SeqCst);
            let stale = match view.as_ref() {
                Some(v) => v.generation != generation || v.built_at.elapsed() >= SUB_CHANNEL_TTL,
                None => true,
            };
            if stale {
                let mut map = HashMap::new();
                for instance in self.instances.read().values() {
                    let account = instance.account();
                    for sub in &account.sub_channels {
                        map.insert(sub.channel_id.clone(), account.channel_id.clone());
                    }
                }
                *view = Some(SubChannelView {
                    built_at: Instant::now(),
                    generation,
                    map,
                });
            }
            view.as_ref()?.map.get(sub_channel_id).cloned()
        };
        self.by_channel(&channel_id?)
    }

    /// Find the instance owning any of its channels: main, sub or private.
    pub fn by_any_channel(&self, channel_id: &str) -> Option<Arc<UpstreamInstance>> {
        if let Some(instance) = self.by_channel(channel_id) {
            return Some(instance);
        }
        if let Some(instance) = self.by_sub_channel(channel_id) {
            return Some(instance);
        }
        self.instances
            .read()
            .values()
            .find(|i| i.matches_channel(channel_id))
            .cloned()
    }

    /// Monotonic round-robin cursor for the Polling selection rule.
    pub fn next_poll_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.poll_counter.fetch_add(1, Ordering::SeqCst) % len
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NotificationBus;
    use crate::locks::KeyLockManager;
    use crate::transport::tests_support::StubGateway;
    use easel_store::MemoryTaskStore;
    use easel_types::SubChannel;

    fn start_instance(account: Account) -> Arc<UpstreamInstance> {
        UpstreamInstance::start(
            account,
            Arc::new(StubGateway::default()),
            Arc::new(MemoryTaskStore::new()),
            Arc::new(KeyLockManager::new()),
            NotificationBus::new(),
        )
    }

    #[tokio::test]
    async fn sub_channel_reverse_lookup() {
        let registry = AccountRegistry::new();
        let mut account = Account::new("chan-1", "guild-1");
        account.sub_channels.push(SubChannel {
            guild_id: "guild-2".to_string(),
            channel_id: "sub-7".to_string(),
        });
        registry.register(start_instance(account));

        let found = registry.by_sub_channel("sub-7").unwrap();
        assert_eq!(found.channel_id(), "chan-1");
        assert!(registry.by_sub_channel("sub-8").is_none());
    }

    #[tokio::test]
    async fn view_rebuilds_after_mutation() {
        let registry = AccountRegistry::new();
        let mut account = Account::new("chan-1", "guild-1");
        registry.register(start_instance(account.clone()));
        assert!(registry.by_sub_channel("sub-7").is_none());

        account.sub_channels.push(SubChannel {
            guild_id: "guild-1".to_string(),
            channel_id: "sub-7".to_string(),
        });
        assert!(registry.update_account(account));
        assert!(registry.by_sub_channel("sub-7").is_some());
    }

    #[tokio::test]
    async fn alive_excludes_disconnected() {
        let registry = AccountRegistry::new();
        let instance = start_instance(Account::new("chan-1", "guild-1"));
        registry.register(instance.clone());
        assert_eq!(registry.alive().len(), 1);

        instance.set_connected(false);
        assert!(registry.alive().is_empty());
    }

    #[tokio::test]
    async fn private_channel_resolves_through_any_channel() {
        let registry = AccountRegistry::new();
        let mut account = Account::new("chan-1", "guild-1");
        account.private_channel_id = "dm-1".to_string();
        registry.register(start_instance(account));

        let found = registry.by_any_channel("dm-1").unwrap();
        assert_eq!(found.channel_id(), "chan-1");
    }

    #[test]
    fn poll_counter_wraps() {
        let registry = AccountRegistry::new();
        assert_eq!(registry.next_poll_index(3), 0);
        assert_eq!(registry.next_poll_index(3), 1);
        assert_eq!(registry.next_poll_index(3), 2);
        assert_eq!(registry.next_poll_index(3), 0);
    }
}
