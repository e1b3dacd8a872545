// Transport seams.
// The WebSocket framing, HTTP signing and reconnect logic live outside
// the core; instances drive their backend through these traits only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use easel_types::{BackendFamily, BotFamily, EventData};

use crate::error::Result;

// ============================================================================
// Command result
// ============================================================================

/// Result of one backend command send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub code: i32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Message {
    pub const SUCCESS: i32 = 1;
    pub const NOT_FOUND: i32 = 9;
    pub const EXISTED: i32 = 21;
    pub const IN_QUEUE: i32 = 22;

    pub fn success() -> Self {
        Self::of(Self::SUCCESS, "success")
    }

    pub fn success_with(result: impl Into<String>) -> Self {
        let mut message = Self::success();
        message.result = Some(result.into());
        message
    }

    pub fn of(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }

    /// Codes the worker treats as "command landed, await events".
    pub fn is_accepted(&self) -> bool {
        matches!(self.code, Self::SUCCESS | Self::EXISTED | Self::IN_QUEUE)
    }
}

/// Where a command is sent: the account's channel plus bot routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendContext {
    pub channel_id: String,
    pub guild_id: String,
    pub bot_family: BotFamily,
    pub backend_family: BackendFamily,
}

/// Aspect ratio preset for blend jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlendDimensions {
    Portrait,
    Square,
    Landscape,
}

// ============================================================================
// Gateway sender
// ============================================================================

/// One send primitive per backend command. Implementations serialize
/// nothing themselves; pacing and ordering are the instance's concern.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait GatewaySender: Send + Sync {
    async fn imagine(&self, ctx: &SendContext, prompt: &str, nonce: &str) -> Result<Message>;

    /// Generic button interaction, also the first phase of every modal.
    async fn action(
        &self,
        ctx: &SendContext,
        message_id: &str,
        custom_id: &str,
        flags: u64,
        nonce: &str,
    ) -> Result<Message>;

    async fn upscale(
        &self,
        ctx: &SendContext,
        message_id: &str,
        index: u8,
        hash: &str,
        flags: u64,
        nonce: &str,
    ) -> Result<Message>;

    async fn variation(
        &self,
        ctx: &SendContext,
        message_id: &str,
        index: u8,
        hash: &str,
        flags: u64,
        nonce: &str,
    ) -> Result<Message>;

    async fn reroll(
        &self,
        ctx: &SendContext,
        message_id: &str,
        hash: &str,
        flags: u64,
        nonce: &str,
    ) -> Result<Message>;

    async fn describe(&self, ctx: &SendContext, link: &str, nonce: &str) -> Result<Message>;

    async fn blend(
        &self,
        ctx: &SendContext,
        urls: &[String],
        dimensions: BlendDimensions,
        nonce: &str,
    ) -> Result<Message>;

    async fn shorten(&self, ctx: &SendContext, prompt: &str, nonce: &str) -> Result<Message>;

    /// Second phase of a CustomZoom confirm window.
    async fn zoom(
        &self,
        ctx: &SendContext,
        modal_message_id: &str,
        custom_id: &str,
        prompt: &str,
        nonce: &str,
    ) -> Result<Message>;

    /// Second phase of a region-repaint confirm window.
    async fn inpaint(
        &self,
        ctx: &SendContext,
        interaction_id: &str,
        custom_id: &str,
        prompt: &str,
        mask_base64: &str,
    ) -> Result<Message>;

    /// Second phase of a PicReader / PromptAnalyzer confirm window.
    async fn pic_reader(
        &self,
        ctx: &SendContext,
        modal_message_id: &str,
        custom_id: &str,
        prompt: &str,
        nonce: &str,
    ) -> Result<Message>;

    /// Second phase of a remix confirm window.
    async fn remix(
        &self,
        ctx: &SendContext,
        modal_message_id: &str,
        custom_id: &str,
        prompt: &str,
        nonce: &str,
    ) -> Result<Message>;

    async fn setting(&self, ctx: &SendContext, nonce: &str) -> Result<Message>;

    async fn info(&self, ctx: &SendContext, nonce: &str) -> Result<Message>;

    async fn setting_select(
        &self,
        ctx: &SendContext,
        message_id: &str,
        custom_id: &str,
        value: &str,
        nonce: &str,
    ) -> Result<Message>;

    async fn setting_button(
        &self,
        ctx: &SendContext,
        message_id: &str,
        custom_id: &str,
        nonce: &str,
    ) -> Result<Message>;

    /// Re-materialize a finished job into the channel.
    async fn show(&self, ctx: &SendContext, job_id: &str, nonce: &str) -> Result<Message>;

    /// Post the seed lookup command into a private bot channel.
    async fn seed(
        &self,
        ctx: &SendContext,
        private_channel_id: &str,
        hash: &str,
        nonce: &str,
    ) -> Result<Message>;

    /// Fetch recent messages from a private bot channel (seed polling).
    async fn seed_messages(
        &self,
        ctx: &SendContext,
        private_channel_id: &str,
    ) -> Result<Vec<EventData>>;

    async fn reaction(
        &self,
        ctx: &SendContext,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message>;

    /// Post an uploaded attachment into a channel; `result` carries the
    /// resulting message URL.
    async fn send_image(
        &self,
        ctx: &SendContext,
        channel_id: &str,
        upload_handle: &str,
    ) -> Result<Message>;

    /// Upload raw bytes; `result` carries an URL or an attachment handle.
    async fn upload(&self, ctx: &SendContext, filename: &str, data: &[u8]) -> Result<Message>;
}

// ============================================================================
// Image re-hosting
// ============================================================================

/// Re-hosts a caller-supplied image link onto storage the backend accepts.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn rehost(&self, url: &str) -> Result<String>;
}

/// Pass-through host used when re-hosting is disabled or unavailable.
pub struct PassthroughHost;

#[async_trait]
impl ImageHost for PassthroughHost {
    async fn rehost(&self, url: &str) -> Result<String> {
        Ok(url.to_string())
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod tests_support {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub op: &'static str,
        pub detail: String,
    }

    /// Gateway stub: records every send and replays scripted results
    /// (falling back to plain success).
    #[derive(Default)]
    pub struct StubGateway {
        calls: Mutex<Vec<RecordedCall>>,
        scripted: Mutex<VecDeque<Message>>,
    }

    impl StubGateway {
        pub fn script(&self, message: Message) {
            self.scripted.lock().push_back(message);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }

        pub fn ops(&self) -> Vec<&'static str> {
            self.calls.lock().iter().map(|c| c.op).collect()
        }

        pub fn detail_of(&self, op: &'static str) -> Option<String> {
            self.calls
                .lock()
                .iter()
                .find(|c| c.op == op)
                .map(|c| c.detail.clone())
        }

        fn record(&self, op: &'static str, detail: String) -> Result<Message> {
            self.calls.lock().push(RecordedCall { op, detail });
            Ok(self
                .scripted
                .lock()
                .pop_front()
                .unwrap_or_else(Message::success))
        }
    }

    #[async_trait]
    impl GatewaySender for StubGateway {
        async fn imagine(&self, _ctx: &SendContext, prompt: &str, _nonce: &str) -> Result<Message> {
            self.record("imagine", prompt.to_string())
        }

        async fn action(
            &self,
            _ctx: &SendContext,
            message_id: &str,
            custom_id: &str,
            _flags: u64,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("action", format!("{message_id}|{custom_id}"))
        }

        async fn upscale(
            &self,
            _ctx: &SendContext,
            _message_id: &str,
            index: u8,
            hash: &str,
            _flags: u64,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("upscale", format!("{index}|{hash}"))
        }

        async fn variation(
            &self,
            _ctx: &SendContext,
            _message_id: &str,
            index: u8,
            hash: &str,
            _flags: u64,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("variation", format!("{index}|{hash}"))
        }

        async fn reroll(
            &self,
            _ctx: &SendContext,
            _message_id: &str,
            hash: &str,
            _flags: u64,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("reroll", hash.to_string())
        }

        async fn describe(&self, _ctx: &SendContext, link: &str, _nonce: &str) -> Result<Message> {
            self.record("describe", link.to_string())
        }

        async fn blend(
            &self,
            _ctx: &SendContext,
            urls: &[String],
            _dimensions: BlendDimensions,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("blend", urls.join(" "))
        }

        async fn shorten(&self, _ctx: &SendContext, prompt: &str, _nonce: &str) -> Result<Message> {
            self.record("shorten", prompt.to_string())
        }

        async fn zoom(
            &self,
            _ctx: &SendContext,
            _modal_message_id: &str,
            custom_id: &str,
            prompt: &str,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("zoom", format!("{custom_id}|{prompt}"))
        }

        async fn inpaint(
            &self,
            _ctx: &SendContext,
            _interaction_id: &str,
            custom_id: &str,
            prompt: &str,
            _mask_base64: &str,
        ) -> Result<Message> {
            self.record("inpaint", format!("{custom_id}|{prompt}"))
        }

        async fn pic_reader(
            &self,
            _ctx: &SendContext,
            _modal_message_id: &str,
            custom_id: &str,
            prompt: &str,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("pic_reader", format!("{custom_id}|{prompt}"))
        }

        async fn remix(
            &self,
            _ctx: &SendContext,
            _modal_message_id: &str,
            custom_id: &str,
            prompt: &str,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("remix", format!("{custom_id}|{prompt}"))
        }

        async fn setting(&self, _ctx: &SendContext, _nonce: &str) -> Result<Message> {
            self.record("setting", String::new())
        }

        async fn info(&self, _ctx: &SendContext, _nonce: &str) -> Result<Message> {
            self.record("info", String::new())
        }

        async fn setting_select(
            &self,
            _ctx: &SendContext,
            _message_id: &str,
            custom_id: &str,
            value: &str,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("setting_select", format!("{custom_id}|{value}"))
        }

        async fn setting_button(
            &self,
            _ctx: &SendContext,
            _message_id: &str,
            custom_id: &str,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("setting_button", custom_id.to_string())
        }

        async fn show(&self, _ctx: &SendContext, job_id: &str, _nonce: &str) -> Result<Message> {
            self.record("show", job_id.to_string())
        }

        async fn seed(
            &self,
            _ctx: &SendContext,
            private_channel_id: &str,
            hash: &str,
            _nonce: &str,
        ) -> Result<Message> {
            self.record("seed", format!("{private_channel_id}|{hash}"))
        }

        async fn seed_messages(
            &self,
            _ctx: &SendContext,
            private_channel_id: &str,
        ) -> Result<Vec<EventData>> {
            self.calls.lock().push(RecordedCall {
                op: "seed_messages",
                detail: private_channel_id.to_string(),
            });
            Ok(Vec::new())
        }

        async fn reaction(
            &self,
            _ctx: &SendContext,
            channel_id: &str,
            message_id: &str,
            emoji: &str,
        ) -> Result<Message> {
            self.record("reaction", format!("{channel_id}|{message_id}|{emoji}"))
        }

        async fn send_image(
            &self,
            _ctx: &SendContext,
            channel_id: &str,
            upload_handle: &str,
        ) -> Result<Message> {
            self.record("send_image", format!("{channel_id}|{upload_handle}"))
                .map(|mut m| {
                    if m.result.is_none() {
                        m.result = Some(format!("https://cdn.example/{upload_handle}"));
                    }
                    m
                })
        }

        async fn upload(
            &self,
            _ctx: &SendContext,
            filename: &str,
            data: &[u8],
        ) -> Result<Message> {
            self.record("upload", format!("{filename}|{}", data.len()))
                .map(|mut m| {
                    if m.result.is_none() {
                        m.result = Some(filename.to_string());
                    }
                    m
                })
        }
    }
}
