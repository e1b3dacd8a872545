// Core configuration
// Plain serde structs; the embedding service loads and injects them.

use serde::{Deserialize, Serialize};

/// Account selection rule applied by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountChooseRule {
    BestWaitIdle,
    Random,
    Weight,
    Polling,
}

impl Default for AccountChooseRule {
    fn default() -> Self {
        AccountChooseRule::BestWaitIdle
    }
}

/// Configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub account_choose_rule: AccountChooseRule,
    /// Weight of idle worker capacity in the BestWaitIdle load formula
    /// (`queued + running - core_size * idle_bias`).
    #[serde(default = "default_idle_bias")]
    pub idle_bias: f64,
    /// Route prompts to domain-specialised accounts when their keywords hit.
    #[serde(default)]
    pub enable_vertical_domain: bool,
    /// Accept caller-supplied base64 image payloads.
    #[serde(default = "default_enabled")]
    pub enable_user_custom_upload_base64: bool,
    /// Re-host caller image links instead of passing them through to the
    /// chat backend.
    #[serde(default)]
    pub enable_save_user_upload_link: bool,
    /// Re-host caller image links before handing them to partner
    /// (YouChuan) accounts.
    #[serde(default = "default_enabled")]
    pub enable_you_chuan_prompt_link: bool,
    /// Coerce NIJI submissions onto MJ accounts.
    #[serde(default)]
    pub enable_convert_niji_to_mj: bool,
    #[serde(default)]
    pub enable_video: bool,
    /// Modal two-phase confirm: record-poll cadence and bounds.
    #[serde(default = "default_modal_poll_interval_ms")]
    pub modal_poll_interval_ms: u64,
    #[serde(default = "default_modal_timeout_secs")]
    pub modal_timeout_secs: u64,
    /// Pause between the confirm window opening and the second-phase send.
    #[serde(default = "default_modal_confirm_delay_ms")]
    pub modal_confirm_delay_ms: u64,
    #[serde(default = "default_seed_timeout_secs")]
    pub seed_timeout_secs: u64,
    /// Absolute expiration of the domain / banned-word derived views, minutes.
    #[serde(default = "default_dictionary_ttl_minutes")]
    pub dictionary_ttl_minutes: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_idle_bias() -> f64 {
    1.0
}

fn default_modal_poll_interval_ms() -> u64 {
    2_500
}

fn default_modal_timeout_secs() -> u64 {
    5 * 60
}

fn default_modal_confirm_delay_ms() -> u64 {
    1_200
}

fn default_seed_timeout_secs() -> u64 {
    3 * 60
}

fn default_dictionary_ttl_minutes() -> u64 {
    30
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            account_choose_rule: AccountChooseRule::default(),
            idle_bias: default_idle_bias(),
            enable_vertical_domain: false,
            enable_user_custom_upload_base64: true,
            enable_save_user_upload_link: false,
            enable_you_chuan_prompt_link: true,
            enable_convert_niji_to_mj: false,
            enable_video: false,
            modal_poll_interval_ms: default_modal_poll_interval_ms(),
            modal_timeout_secs: default_modal_timeout_secs(),
            modal_confirm_delay_ms: default_modal_confirm_delay_ms(),
            seed_timeout_secs: default_seed_timeout_secs(),
            dictionary_ttl_minutes: default_dictionary_ttl_minutes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_rule_parses_from_config_names() {
        let rule: AccountChooseRule = serde_json::from_str("\"BestWaitIdle\"").unwrap();
        assert_eq!(rule, AccountChooseRule::BestWaitIdle);
        let rule: AccountChooseRule = serde_json::from_str("\"Polling\"").unwrap();
        assert_eq!(rule, AccountChooseRule::Polling);
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.modal_poll_interval_ms, 2_500);
        assert_eq!(config.modal_timeout_secs, 300);
        assert!(config.enable_user_custom_upload_base64);
        assert!(!config.enable_vertical_domain);
        assert_eq!(config.idle_bias, 1.0);
    }
}
