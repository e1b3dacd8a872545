// Upstream account model
// Accounts are created and mutated out of band; the core observes them
// through the registry.

use std::collections::HashMap;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::task::{BackendFamily, BotFamily, SpeedMode};

/// A sub channel an account can draw in, mapped back to the owning channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubChannel {
    pub guild_id: String,
    pub channel_id: String,
}

/// One upstream account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Primary channel id; doubles as the instance id.
    pub channel_id: String,
    pub guild_id: String,
    pub backend_family: BackendFamily,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub enable_mj: bool,
    #[serde(default)]
    pub enable_niji: bool,
    /// Private channel receiving `/info` and `/show` for the MJ bot.
    #[serde(default)]
    pub private_channel_id: String,
    /// Private channel for the NIJI bot.
    #[serde(default)]
    pub niji_private_channel_id: String,
    /// Worker-pool size.
    #[serde(default = "default_core_size")]
    pub core_size: usize,
    /// Default queue capacity, per speed mode.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Per-mode queue capacity overrides.
    #[serde(default)]
    pub mode_queue_sizes: HashMap<SpeedMode, usize>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Wait before the first send of a burst, milliseconds.
    #[serde(default)]
    pub interval_ms: u64,
    /// Pacing bounds between successive sends, milliseconds.
    #[serde(default = "default_after_interval")]
    pub after_interval_min_ms: u64,
    #[serde(default = "default_after_interval")]
    pub after_interval_max_ms: u64,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub sort: u32,
    /// `HH:MM-HH:MM[,HH:MM-HH:MM...]` windows in which the account works.
    /// Empty means always.
    #[serde(default)]
    pub work_time: String,
    /// Windows in which the account idles ("fishing") and accepts nothing.
    #[serde(default)]
    pub fish_time: String,
    #[serde(default)]
    pub sub_channels: Vec<SubChannel>,
    /// Allowed speed modes. Empty means all.
    #[serde(default)]
    pub allowed_modes: Vec<SpeedMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SpeedMode>,
    #[serde(default = "default_true")]
    pub enable_blend: bool,
    #[serde(default = "default_true")]
    pub enable_describe: bool,
    #[serde(default = "default_true")]
    pub enable_shorten: bool,
    /// Whether this account participates in vertical-domain routing.
    #[serde(default)]
    pub vertical_domain: bool,
    /// Domain tags this account is specialised in.
    #[serde(default)]
    pub domain_ids: Vec<String>,
    /// Remix toggle state for the MJ bot.
    #[serde(default)]
    pub remix: bool,
    /// Remix toggle state for the NIJI bot.
    #[serde(default)]
    pub niji_remix: bool,
    /// Submit the remix window automatically instead of returning it
    /// to the caller for confirmation.
    #[serde(default)]
    pub remix_auto_submit: bool,
    /// Current state of the "High Variation Mode" settings button.
    #[serde(default)]
    pub high_variability: bool,
}

fn default_true() -> bool {
    true
}

fn default_core_size() -> usize {
    3
}

fn default_queue_size() -> usize {
    10
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_after_interval() -> u64 {
    1200
}

fn default_weight() -> u32 {
    1
}

impl Account {
    pub fn new(channel_id: impl Into<String>, guild_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            guild_id: guild_id.into(),
            backend_family: BackendFamily::Chat,
            enabled: true,
            enable_mj: true,
            enable_niji: false,
            private_channel_id: String::new(),
            niji_private_channel_id: String::new(),
            core_size: default_core_size(),
            queue_size: default_queue_size(),
            mode_queue_sizes: HashMap::new(),
            timeout_minutes: default_timeout_minutes(),
            interval_ms: 0,
            after_interval_min_ms: default_after_interval(),
            after_interval_max_ms: default_after_interval(),
            weight: default_weight(),
            sort: 0,
            work_time: String::new(),
            fish_time: String::new(),
            sub_channels: Vec::new(),
            allowed_modes: Vec::new(),
            mode: None,
            enable_blend: true,
            enable_describe: true,
            enable_shorten: true,
            vertical_domain: false,
            domain_ids: Vec::new(),
            remix: false,
            niji_remix: false,
            remix_auto_submit: false,
            high_variability: false,
        }
    }

    /// Queue capacity for a mode, honoring per-mode overrides.
    pub fn queue_size_for(&self, mode: SpeedMode) -> usize {
        self.mode_queue_sizes
            .get(&mode)
            .copied()
            .unwrap_or(self.queue_size)
    }

    pub fn supports_bot(&self, bot: BotFamily) -> bool {
        match bot {
            BotFamily::Mj => self.enable_mj,
            BotFamily::Niji => self.enable_niji,
        }
    }

    pub fn is_mode_allowed(&self, mode: SpeedMode) -> bool {
        self.allowed_modes.is_empty() || self.allowed_modes.contains(&mode)
    }

    pub fn remix_enabled(&self, bot: BotFamily) -> bool {
        match bot {
            BotFamily::Mj => self.remix,
            BotFamily::Niji => self.niji_remix,
        }
    }

    pub fn private_channel_for(&self, bot: BotFamily) -> &str {
        match bot {
            BotFamily::Mj => &self.private_channel_id,
            BotFamily::Niji => &self.niji_private_channel_id,
        }
    }

    /// True while the clock is inside the account's work window and
    /// outside its fishing window.
    pub fn is_working_at(&self, now: NaiveTime) -> bool {
        in_windows_or(&self.work_time, now, true) && !in_windows_or(&self.fish_time, now, false)
    }
}

/// Check `now` against `HH:MM-HH:MM[,...]` windows. An empty or
/// unparseable spec yields `empty_value`.
fn in_windows_or(spec: &str, now: NaiveTime, empty_value: bool) -> bool {
    let spec = spec.trim();
    if spec.is_empty() {
        return empty_value;
    }
    let mut any_valid = false;
    for window in spec.split(',') {
        let Some((start, end)) = window.trim().split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            NaiveTime::parse_from_str(start.trim(), "%H:%M"),
            NaiveTime::parse_from_str(end.trim(), "%H:%M"),
        ) else {
            continue;
        };
        any_valid = true;
        // Windows crossing midnight wrap around.
        let inside = if start <= end {
            now >= start && now < end
        } else {
            now >= start || now < end
        };
        if inside {
            return true;
        }
    }
    if any_valid {
        false
    } else {
        empty_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn empty_work_window_is_always_on() {
        let account = Account::new("c", "g");
        assert!(account.is_working_at(t(3, 0)));
    }

    #[test]
    fn work_window_bounds() {
        let mut account = Account::new("c", "g");
        account.work_time = "09:00-18:00".to_string();
        assert!(account.is_working_at(t(9, 0)));
        assert!(account.is_working_at(t(17, 59)));
        assert!(!account.is_working_at(t(18, 0)));
        assert!(!account.is_working_at(t(8, 59)));
    }

    #[test]
    fn fish_window_excludes() {
        let mut account = Account::new("c", "g");
        account.fish_time = "12:00-13:00".to_string();
        assert!(!account.is_working_at(t(12, 30)));
        assert!(account.is_working_at(t(13, 30)));
    }

    #[test]
    fn window_crossing_midnight() {
        let mut account = Account::new("c", "g");
        account.work_time = "22:00-02:00".to_string();
        assert!(account.is_working_at(t(23, 0)));
        assert!(account.is_working_at(t(1, 0)));
        assert!(!account.is_working_at(t(12, 0)));
    }

    #[test]
    fn per_mode_queue_override() {
        let mut account = Account::new("c", "g");
        account.queue_size = 10;
        account.mode_queue_sizes.insert(SpeedMode::Relax, 2);
        assert_eq!(account.queue_size_for(SpeedMode::Fast), 10);
        assert_eq!(account.queue_size_for(SpeedMode::Relax), 2);
    }
}
