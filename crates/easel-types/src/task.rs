// Task model
// The task is the unit of work handed to an upstream account instance.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enums
// ============================================================================

/// Drawing action carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    Imagine,
    Upscale,
    Variation,
    Reroll,
    Describe,
    Blend,
    Shorten,
    Zoom,
    Pan,
    Inpaint,
    Edit,
    Retexture,
    Video,
    Show,
    Action,
    Seed,
}

/// Task lifecycle status.
///
/// Transitions are monotonic except that a task may bounce
/// NOT_START -> MODAL -> NOT_START exactly once for the two-phase
/// window-confirm path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStart,
    Modal,
    Submitted,
    InProgress,
    Success,
    Failure,
    Cancel,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancel)
    }
}

/// Logical bot style. Affects remix toggles and which private channel
/// receives `/info` and `/show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotFamily {
    Mj,
    Niji,
}

/// Upstream provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendFamily {
    Chat,
    Partner,
    Official,
}

/// Scheduling speed mode. Each account advertises allowed modes and a
/// per-mode queue capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeedMode {
    Fast,
    Relax,
    Turbo,
}

// ============================================================================
// Buttons
// ============================================================================

/// One actionable component of the follow-up button grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub custom_id: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub label: String,
    /// Upstream component style (2 = secondary, 3 = success ...).
    #[serde(default)]
    pub style: u8,
    /// Upstream component type (2 = button).
    #[serde(default = "default_button_type")]
    pub r#type: u8,
}

fn default_button_type() -> u8 {
    2
}

impl Button {
    pub fn new(custom_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            emoji: String::new(),
            label: label.into(),
            style: 2,
            r#type: 2,
        }
    }
}

// ============================================================================
// Properties
// ============================================================================

/// Typed correlation and protocol state recorded on a task.
///
/// The upstream echoes `nonce` on command responses; `message_id` and
/// `message_hash` are assigned on first event correlation and unique for
/// the task's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_prompt: Option<String>,
    /// Custom id recorded from a previous remix modal, reused on re-rolls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_custom_id: Option<String>,
    /// Message id of the open remix/confirm window, written by the correlator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_modal_message_id: Option<String>,
    /// The parent's upsample custom id, kept for PanModal synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_u_custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_metadata_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_message_id: Option<String>,
    /// Whether the task is waiting in a remix/confirm window.
    #[serde(default)]
    pub remix_modal: bool,
}

// ============================================================================
// Account filter
// ============================================================================

/// Caller-supplied selection preferences attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    /// Acceptable speed modes, in preference order. Empty = any.
    #[serde(default)]
    pub modes: Vec<SpeedMode>,
    /// Restrict selection to these instance (channel) ids. Empty = any.
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// Domain tags the caller wants the account specialised in.
    #[serde(default)]
    pub domain_ids: Vec<String>,
    /// Caller preference for the remix toggle, when it matters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix: Option<bool>,
}

// ============================================================================
// Task
// ============================================================================

/// A drawing task and its full lineage state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Sortable, time-prefixed identifier.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub bot_family: BotFamily,
    pub backend_family: BackendFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SpeedMode>,
    #[serde(default)]
    pub prompt: String,
    /// English prompt used for banned-word scanning and domain routing.
    #[serde(default)]
    pub prompt_en: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Intermediate images observed while the job renders.
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub buttons: Vec<Button>,
    #[serde(default)]
    pub properties: TaskProperties,
    pub submit_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    /// Render progress string, e.g. "50%".
    #[serde(default)]
    pub progress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    /// Channel id of the owning account instance while non-terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_instance_id: Option<String>,
    #[serde(default)]
    pub account_filter: AccountFilter,
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a sortable, time-prefixed task id.
pub fn generate_task_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!("{millis}{seq:04}")
}

/// Generate a numeric nonce echoed back by the upstream on command replies.
pub fn generate_nonce() -> String {
    let millis = Utc::now().timestamp_millis() as u64;
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed) % 4096;
    format!("{}", (millis << 12) | seq)
}

impl Task {
    pub fn new(action: TaskAction, bot_family: BotFamily, backend_family: BackendFamily) -> Self {
        Self {
            id: generate_task_id(),
            parent_id: None,
            action,
            status: TaskStatus::NotStart,
            bot_family,
            backend_family,
            mode: None,
            prompt: String::new(),
            prompt_en: String::new(),
            description: String::new(),
            image_url: None,
            image_urls: Vec::new(),
            buttons: Vec::new(),
            properties: TaskProperties::default(),
            submit_time: Utc::now(),
            start_time: None,
            finish_time: None,
            fail_reason: None,
            progress: String::new(),
            seed: None,
            instance_id: None,
            sub_instance_id: None,
            account_filter: AccountFilter::default(),
        }
    }

    /// Spawn a follow-up task inheriting lineage from `self`.
    pub fn spawn_child(&self, action: TaskAction) -> Task {
        let mut child = Task::new(action, self.bot_family, self.backend_family);
        child.parent_id = Some(self.id.clone());
        child.account_filter = self.account_filter.clone();
        child.instance_id = self.instance_id.clone();
        child
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.start_time = Some(Utc::now());
        if self.progress.is_empty() {
            self.progress = "0%".to_string();
        }
    }

    pub fn succeed(&mut self) {
        self.status = TaskStatus::Success;
        self.finish_time = Some(Utc::now());
        self.progress = "100%".to_string();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failure;
        self.finish_time = Some(Utc::now());
        self.fail_reason = Some(reason.into());
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancel;
        self.finish_time = Some(Utc::now());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_distinct_and_sortable() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_ne!(a, b);
        // Time prefix keeps later ids lexicographically >= earlier ones
        // for equal-length ids.
        assert!(b >= a);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(TaskStatus::Cancel.is_terminal());
        assert!(!TaskStatus::Modal.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn child_inherits_families() {
        let mut parent = Task::new(TaskAction::Imagine, BotFamily::Niji, BackendFamily::Chat);
        parent.instance_id = Some("chan-1".to_string());
        let child = parent.spawn_child(TaskAction::Variation);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.bot_family, BotFamily::Niji);
        assert_eq!(child.backend_family, BackendFamily::Chat);
        assert_eq!(child.instance_id.as_deref(), Some("chan-1"));
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&TaskStatus::NotStart).unwrap();
        assert_eq!(json, "\"NOT_START\"");
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
