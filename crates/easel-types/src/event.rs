// Normalized upstream notifications.
// Chat-gateway messages and partner/official poll callbacks both end up
// in the correlator through these shapes.

use serde::{Deserialize, Serialize};

use crate::task::{Button, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRow {
    #[serde(default)]
    pub components: Vec<Button>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One chat-platform message, already unframed by the gateway transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    pub id: String,
    pub author_id: String,
    pub kind: MessageKind,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub components: Vec<ComponentRow>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_metadata: Option<InteractionMetadata>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl EventData {
    pub fn first_image(&self) -> Option<&Attachment> {
        self.attachments.iter().find(|a| {
            let name = a.filename.to_lowercase();
            name.ends_with(".png")
                || name.ends_with(".jpg")
                || name.ends_with(".jpeg")
                || name.ends_with(".webp")
                || name.ends_with(".gif")
                || a.url.contains("/attachments/")
        })
    }

    pub fn buttons(&self) -> Vec<Button> {
        self.components
            .iter()
            .flat_map(|row| row.components.iter().cloned())
            .collect()
    }
}

/// Polled state of a partner/official job, normalized onto the same
/// correlator update path as gateway events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollUpdate {
    /// Upstream job id, recorded as the task nonce at submit time.
    pub nonce: String,
    pub instance_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub buttons: Vec<Button>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}
