// Load balancer.
// A pure selection over the registry's live instances; the four rules
// come from the global config.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::Rng;

use easel_types::{BackendFamily, BotFamily, SpeedMode};

use crate::config::{AccountChooseRule, CoreConfig};
use crate::instance::UpstreamInstance;
use crate::registry::AccountRegistry;

/// Capability an operation requires from the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Blend,
    Describe,
    Shorten,
}

/// What the orchestrator needs from the selected instance.
#[derive(Debug, Clone, Default)]
pub struct SelectRequirements {
    pub is_new_task: bool,
    pub bot_family: Option<BotFamily>,
    pub capability: Option<Capability>,
    pub preferred_mode: Option<SpeedMode>,
    /// Domain-scoped selection; the orchestrator retries once with
    /// `is_domain = false` when this yields nothing.
    pub is_domain: bool,
    pub domain_ids: Vec<String>,
    /// Whitelist of instance (channel) ids. Empty = any.
    pub instance_ids: Vec<String>,
    /// Acceptable backend families. Empty = any.
    pub backends: Vec<BackendFamily>,
}

/// Pick an instance for the requirements, or `None` when no candidate
/// survives filtering. The rule and its tuning come from the global
/// config.
pub fn choose(
    registry: &AccountRegistry,
    config: &CoreConfig,
    req: &SelectRequirements,
) -> Option<Arc<UpstreamInstance>> {
    let survivors: Vec<Arc<UpstreamInstance>> = registry
        .alive()
        .into_iter()
        .filter(|instance| accepts(instance, req))
        .collect();
    if survivors.is_empty() {
        return None;
    }

    match config.account_choose_rule {
        AccountChooseRule::BestWaitIdle => best_wait_idle(survivors, config.idle_bias),
        AccountChooseRule::Random => {
            let index = rand::thread_rng().gen_range(0..survivors.len());
            survivors.into_iter().nth(index)
        }
        AccountChooseRule::Weight => weighted(survivors),
        AccountChooseRule::Polling => {
            let index = registry.next_poll_index(survivors.len());
            survivors.into_iter().nth(index)
        }
    }
}

fn accepts(instance: &Arc<UpstreamInstance>, req: &SelectRequirements) -> bool {
    if req.is_new_task && !instance.is_accept_new_task() {
        return false;
    }
    let account = instance.account();
    if let Some(bot) = req.bot_family {
        if !account.supports_bot(bot) {
            return false;
        }
    }
    if let Some(capability) = req.capability {
        let ok = match capability {
            Capability::Blend => account.enable_blend,
            Capability::Describe => account.enable_describe,
            Capability::Shorten => account.enable_shorten,
        };
        if !ok {
            return false;
        }
    }
    if let Some(mode) = req.preferred_mode {
        // The instance can still downgrade; only reject accounts that
        // allow no mode reachable from the preference.
        let reachable = match mode {
            SpeedMode::Turbo => [Some(SpeedMode::Turbo), Some(SpeedMode::Fast), Some(SpeedMode::Relax)],
            SpeedMode::Fast => [Some(SpeedMode::Fast), Some(SpeedMode::Relax), None],
            SpeedMode::Relax => [Some(SpeedMode::Relax), None, None],
        };
        if !reachable
            .iter()
            .flatten()
            .any(|m| account.is_mode_allowed(*m))
        {
            return false;
        }
    }
    if !req.instance_ids.is_empty() && !req.instance_ids.contains(&account.channel_id) {
        return false;
    }
    if !req.backends.is_empty() && !req.backends.contains(&account.backend_family) {
        return false;
    }
    if req.is_domain && !req.domain_ids.is_empty() {
        if !account.vertical_domain {
            return false;
        }
        if !req.domain_ids.iter().any(|d| account.domain_ids.contains(d)) {
            return false;
        }
    }
    true
}

/// Minimize `queued + running - core_size * idle_bias`, tie-breaking by
/// (-weight, sort).
fn best_wait_idle(
    survivors: Vec<Arc<UpstreamInstance>>,
    idle_bias: f64,
) -> Option<Arc<UpstreamInstance>> {
    let key = |instance: &Arc<UpstreamInstance>| {
        let account = instance.account();
        let load = (instance.queued_total() + instance.running_count()) as f64
            - account.core_size as f64 * idle_bias;
        (load, account.weight, account.sort)
    };
    survivors.into_iter().min_by(|a, b| {
        let (load_a, weight_a, sort_a) = key(a);
        let (load_b, weight_b, sort_b) = key(b);
        load_a
            .partial_cmp(&load_b)
            .unwrap_or(Ordering::Equal)
            .then_with(|| weight_b.cmp(&weight_a))
            .then_with(|| sort_a.cmp(&sort_b))
    })
}

fn weighted(survivors: Vec<Arc<UpstreamInstance>>) -> Option<Arc<UpstreamInstance>> {
    let weights: Vec<u64> = survivors
        .iter()
        .map(|i| u64::from(i.account().weight.max(1)))
        .collect();
    let total: u64 = weights.iter().sum();
    let mut pick = rand::thread_rng().gen_range(0..total);
    for (instance, weight) in survivors.into_iter().zip(weights) {
        if pick < weight {
            return Some(instance);
        }
        pick -= weight;
    }
    None
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
    use easel_types::Account;

    fn registry_with(accounts: Vec<Account>) -> AccountRegistry {
        let registry = AccountRegistry::new();
        for account in accounts {
            registry.register(UpstreamInstance::start(
                account,
                Arc::new(StubGateway::default()),
                Arc::new(MemoryTaskStore::new()),
                Arc::new(KeyLockManager::new()),
                NotificationBus::new(),
            ));
        }
        registry
    }

    fn account(channel: &str, core: usize, weight: u32, sort: u32) -> Account {
        let mut account = Account::new(channel, "guild");
        account.core_size = core;
        account.weight = weight;
        account.sort = sort;
        account
    }

    fn config_with(rule: AccountChooseRule) -> CoreConfig {
        CoreConfig {
            account_choose_rule: rule,
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn best_wait_idle_prefers_more_idle_capacity() {
        let registry = registry_with(vec![account("a", 2, 1, 0), account("b", 1, 1, 1)]);
        let req = SelectRequirements {
            is_new_task: true,
            ..SelectRequirements::default()
        };
        let chosen = choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).unwrap();
        assert_eq!(chosen.channel_id(), "a");
        for instance in registry.all() {
            instance.shutdown();
        }
    }

    #[tokio::test]
    async fn idle_bias_scales_core_size_in_the_load() {
        let registry = registry_with(vec![account("a", 4, 1, 1), account("b", 1, 1, 0)]);
        let req = SelectRequirements {
            is_new_task: true,
            ..SelectRequirements::default()
        };

        // Full bias favors the larger idle pool.
        let chosen = choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).unwrap();
        assert_eq!(chosen.channel_id(), "a");

        // Zero bias ignores pool size; the tie falls through to sort.
        let config = CoreConfig {
            idle_bias: 0.0,
            ..config_with(AccountChooseRule::BestWaitIdle)
        };
        let chosen = choose(&registry, &config, &req).unwrap();
        assert_eq!(chosen.channel_id(), "b");
        for instance in registry.all() {
            instance.shutdown();
        }
    }

    #[tokio::test]
    async fn best_wait_idle_tie_breaks_by_weight_then_sort() {
        let registry = registry_with(vec![account("a", 2, 5, 1), account("b", 2, 2, 0)]);
        let req = SelectRequirements {
            is_new_task: true,
            ..SelectRequirements::default()
        };
        let chosen = choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).unwrap();
        assert_eq!(chosen.channel_id(), "a");
        for instance in registry.all() {
            instance.shutdown();
        }
    }

    #[tokio::test]
    async fn domain_filter_requires_tagged_account() {
        let mut tagged = account("a", 2, 1, 0);
        tagged.vertical_domain = true;
        tagged.domain_ids = vec!["anime".to_string()];
        let registry = registry_with(vec![tagged, account("b", 2, 1, 1)]);

        let req = SelectRequirements {
            is_new_task: true,
            is_domain: true,
            domain_ids: vec!["anime".to_string()],
            ..SelectRequirements::default()
        };
        let chosen = choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).unwrap();
        assert_eq!(chosen.channel_id(), "a");

        let req = SelectRequirements {
            is_new_task: true,
            is_domain: true,
            domain_ids: vec!["cars".to_string()],
            ..SelectRequirements::default()
        };
        assert!(choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).is_none());
        for instance in registry.all() {
            instance.shutdown();
        }
    }

    #[tokio::test]
    async fn whitelist_and_capability_filters() {
        let mut no_blend = account("a", 2, 1, 0);
        no_blend.enable_blend = false;
        let registry = registry_with(vec![no_blend, account("b", 2, 1, 1)]);

        let req = SelectRequirements {
            is_new_task: true,
            capability: Some(Capability::Blend),
            ..SelectRequirements::default()
        };
        let chosen = choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).unwrap();
        assert_eq!(chosen.channel_id(), "b");

        let req = SelectRequirements {
            is_new_task: true,
            instance_ids: vec!["a".to_string()],
            capability: Some(Capability::Blend),
            ..SelectRequirements::default()
        };
        assert!(choose(&registry, &config_with(AccountChooseRule::BestWaitIdle), &req).is_none());
        for instance in registry.all() {
            instance.shutdown();
        }
    }

    #[tokio::test]
    async fn polling_round_robins_over_survivors() {
        let registry = registry_with(vec![account("a", 2, 1, 0), account("b", 2, 1, 1)]);
        let req = SelectRequirements {
            is_new_task: true,
            ..SelectRequirements::default()
        };
        let first = choose(&registry, &config_with(AccountChooseRule::Polling), &req).unwrap();
        let second = choose(&registry, &config_with(AccountChooseRule::Polling), &req).unwrap();
        assert_ne!(first.channel_id(), second.channel_id());
        for instance in registry.all() {
            instance.shutdown();
        }
    }
}
