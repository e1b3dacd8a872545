//! Dry-run gateway: stands in for a real chat-platform transport by
//! fabricating the upstream's progress and completion events. Lets the
//! engine exercise the full submit -> correlate -> terminal pipeline
//! without any network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use easel_core::{Message, Result, SendContext};
use easel_types::{Attachment, Button, ComponentRow, EventData, MessageKind};

pub struct DryRunGateway {
    events_tx: mpsc::UnboundedSender<EventData>,
    counter: AtomicU64,
}

impl DryRunGateway {
    pub fn new(events_tx: mpsc::UnboundedSender<EventData>) -> Self {
        Self {
            events_tx,
            counter: AtomicU64::new(1),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn ok(&self, op: &str, detail: &str) -> Result<Message> {
        debug!("dry-run {op}: {detail}");
        Ok(Message::success())
    }

    /// Emit a render sequence for an accepted job: one progress update,
    /// then the terminal grid message.
    fn emit_render(&self, ctx: &SendContext, prompt: &str, nonce: &str) {
        let channel_id = ctx.channel_id.clone();
        let prompt = prompt.to_string();
        let nonce = nonce.to_string();
        let progress_id = self.next_id("msg");
        let final_id = self.next_id("msg");
        let hash = self.next_id("job");
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut progress = EventData {
                id: progress_id,
                author_id: "bot".to_string(),
                kind: MessageKind::Create,
                channel_id: channel_id.clone(),
                content: format!("**{prompt}** - (42%) <@1> (fast)"),
                attachments: Vec::new(),
                components: Vec::new(),
                embeds: Vec::new(),
                interaction_metadata: None,
                flags: 0,
                referenced_message_id: None,
                nonce: Some(nonce),
            };
            let _ = tx.send(progress.clone());

            tokio::time::sleep(Duration::from_millis(250)).await;
            progress.id = final_id;
            progress.nonce = None;
            progress.content = format!("**{prompt}** - <@1> (fast)");
            progress.attachments.push(Attachment {
                url: format!("https://cdn.invalid/render_{hash}.png"),
                filename: format!("render_{hash}.png"),
                width: 2048,
                height: 2048,
            });
            progress.components = vec![ComponentRow {
                components: (1..=4)
                    .map(|i| Button::new(format!("MJ::JOB::upsample::{i}::{hash}"), format!("U{i}")))
                    .chain((1..=4).map(|i| {
                        Button::new(format!("MJ::JOB::variation::{i}::{hash}"), format!("V{i}"))
                    }))
                    .chain(std::iter::once(Button::new(
                        format!("MJ::JOB::reroll::0::{hash}::SOLO"),
                        "🔄",
                    )))
                    .collect(),
            }];
            let _ = tx.send(progress);
        });
    }
}

#[async_trait]
impl easel_core::GatewaySender for DryRunGateway {
    async fn imagine(&self, ctx: &SendContext, prompt: &str, nonce: &str) -> Result<Message> {
        self.emit_render(ctx, prompt, nonce);
        self.ok("imagine", prompt)
    }

    async fn action(
        &self,
        _ctx: &SendContext,
        message_id: &str,
        custom_id: &str,
        _flags: u64,
        _nonce: &str,
    ) -> Result<Message> {
        self.ok("action", &format!("{message_id} {custom_id}"))
    }

    async fn upscale(
        &self,
        ctx: &SendContext,
        _message_id: &str,
        index: u8,
        hash: &str,
        _flags: u64,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, &format!("upscale {index} {hash}"), nonce);
        self.ok("upscale", hash)
    }

    async fn variation(
        &self,
        ctx: &SendContext,
        _message_id: &str,
        index: u8,
        hash: &str,
        _flags: u64,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, &format!("variation {index} {hash}"), nonce);
        self.ok("variation", hash)
    }

    async fn reroll(
        &self,
        ctx: &SendContext,
        _message_id: &str,
        hash: &str,
        _flags: u64,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, &format!("reroll {hash}"), nonce);
        self.ok("reroll", hash)
    }

    async fn describe(&self, _ctx: &SendContext, link: &str, _nonce: &str) -> Result<Message> {
        self.ok("describe", link)
    }

    async fn blend(
        &self,
        ctx: &SendContext,
        urls: &[String],
        _dimensions: easel_core::BlendDimensions,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, "blend", nonce);
        self.ok("blend", &urls.join(" "))
    }

    async fn shorten(&self, _ctx: &SendContext, prompt: &str, _nonce: &str) -> Result<Message> {
        self.ok("shorten", prompt)
    }

    async fn zoom(
        &self,
        ctx: &SendContext,
        _modal_message_id: &str,
        custom_id: &str,
        prompt: &str,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, prompt, nonce);
        self.ok("zoom", custom_id)
    }

    async fn inpaint(
        &self,
        _ctx: &SendContext,
        _interaction_id: &str,
        custom_id: &str,
        _prompt: &str,
        _mask_base64: &str,
    ) -> Result<Message> {
        self.ok("inpaint", custom_id)
    }

    async fn pic_reader(
        &self,
        ctx: &SendContext,
        _modal_message_id: &str,
        custom_id: &str,
        prompt: &str,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, prompt, nonce);
        self.ok("pic_reader", custom_id)
    }

    async fn remix(
        &self,
        ctx: &SendContext,
        _modal_message_id: &str,
        custom_id: &str,
        prompt: &str,
        nonce: &str,
    ) -> Result<Message> {
        self.emit_render(ctx, prompt, nonce);
        self.ok("remix", custom_id)
    }

    async fn setting(&self, _ctx: &SendContext, _nonce: &str) -> Result<Message> {
        self.ok("setting", "")
    }

    async fn info(&self, _ctx: &SendContext, _nonce: &str) -> Result<Message> {
        self.ok("info", "")
    }

    async fn setting_select(
        &self,
        _ctx: &SendContext,
        _message_id: &str,
        custom_id: &str,
        value: &str,
        _nonce: &str,
    ) -> Result<Message> {
        self.ok("setting_select", &format!("{custom_id}={value}"))
    }

    async fn setting_button(
        &self,
        _ctx: &SendContext,
        _message_id: &str,
        custom_id: &str,
        _nonce: &str,
    ) -> Result<Message> {
        self.ok("setting_button", custom_id)
    }

    async fn show(&self, ctx: &SendContext, job_id: &str, nonce: &str) -> Result<Message> {
        self.emit_render(ctx, &format!("show {job_id}"), nonce);
        self.ok("show", job_id)
    }

    async fn seed(
        &self,
        _ctx: &SendContext,
        private_channel_id: &str,
        hash: &str,
        _nonce: &str,
    ) -> Result<Message> {
        self.ok("seed", &format!("{private_channel_id} {hash}"))
    }

    async fn seed_messages(
        &self,
        _ctx: &SendContext,
        _private_channel_id: &str,
    ) -> Result<Vec<EventData>> {
        Ok(Vec::new())
    }

    async fn reaction(
        &self,
        _ctx: &SendContext,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message> {
        self.ok("reaction", &format!("{channel_id} {message_id} {emoji}"))
    }

    async fn send_image(
        &self,
        _ctx: &SendContext,
        channel_id: &str,
        upload_handle: &str,
    ) -> Result<Message> {
        debug!("dry-run send_image: {channel_id} {upload_handle}");
        Ok(Message::success_with(format!(
            "https://cdn.invalid/{upload_handle}"
        )))
    }

    async fn upload(&self, _ctx: &SendContext, filename: &str, data: &[u8]) -> Result<Message> {
        debug!("dry-run upload: {filename} ({} bytes)", data.len());
        Ok(Message::success_with(filename.to_string()))
    }
}
