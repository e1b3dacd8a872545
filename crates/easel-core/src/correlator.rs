// Event correlator.
// Consumes normalized gateway events plus partner/official poll updates,
// resolves them to in-flight tasks and drives progress and terminal
// transitions. Event replay must be idempotent.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use easel_store::TaskStore;
use easel_types::{EventData, MessageKind, PollUpdate, Task, TaskAction, TaskStatus};

use crate::bus::{NotificationBus, TaskNotice};
use crate::error::Result;
use crate::instance::UpstreamInstance;
use crate::locks::{EventDedup, KeyLockManager};
use crate::registry::AccountRegistry;

const WAITING_MARKER: &str = "(Waiting to start)";
const STOPPED_MARKER: &str = "(Stopped)";

/// Upstream phrases that terminate a task with a failure.
const FAILURE_MARKERS: &[&str] = &[
    "Action needed to continue",
    "Action required to continue",
    "Pending mod message",
    "Banned prompt",
    "Invalid link",
    "Invalid parameter",
    "Queue full",
    "Job action restricted",
    "failed to request POST",
];

/// Message-header shapes for prompt extraction, tried strictly in order.
static CONTENT_SHAPES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\*\*(.*)\*\* - (.*?)<@\d+> \((.*?)\)",
        r"\*\*(.*)\*\* - <@\d+> \((.*?)\)",
        r"\*\*(.*)\*\* - Variations by <@\d+> \((.*?)\)",
        r"\*\*(.*)\*\* - Variations \(.*?\) by <@\d+> \((.*?)\)",
    ]
    .iter()
    .map(|shape| Regex::new(shape).expect("content shape compiles"))
    .collect()
});

static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+)%\)").expect("progress regex compiles"));

static SEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)seed[:\s]+\**(\d+)").expect("seed regex compiles"));

/// Prompt and trailing status parsed from a message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContent {
    pub prompt: String,
    pub status: String,
}

/// Try the four header shapes in order.
pub fn parse_content(content: &str) -> Option<ParsedContent> {
    for shape in CONTENT_SHAPES.iter() {
        if let Some(caps) = shape.captures(content) {
            let prompt = caps.get(1)?.as_str().to_string();
            let status = caps
                .iter()
                .skip(2)
                .flatten()
                .last()
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            return Some(ParsedContent { prompt, status });
        }
    }
    None
}

/// Grid image identifier: the final `_`-separated segment of the
/// attachment filename, without its extension.
pub fn parse_message_hash(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let filename = path.rsplit('/').next()?;
    let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
    let hash = stem.rsplit('_').next()?;
    if hash.is_empty() {
        None
    } else {
        Some(hash.to_string())
    }
}

pub struct Correlator {
    registry: Arc<AccountRegistry>,
    store: Arc<dyn TaskStore>,
    locks: Arc<KeyLockManager>,
    dedup: EventDedup,
    bus: NotificationBus,
}

impl Correlator {
    pub fn new(
        registry: Arc<AccountRegistry>,
        store: Arc<dyn TaskStore>,
        locks: Arc<KeyLockManager>,
        bus: NotificationBus,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
            dedup: EventDedup::default(),
            bus,
        }
    }

    /// Apply one gateway event. Safe to call with replays.
    pub async fn on_event(&self, event: EventData) -> Result<()> {
        if !self.dedup.observe(&event.id) {
            trace!("dropping replayed event {}", event.id);
            return Ok(());
        }

        let Some(instance) = self.registry.by_any_channel(&event.channel_id) else {
            return Ok(());
        };

        let account = instance.account();
        if event.channel_id == account.private_channel_id
            || event.channel_id == account.niji_private_channel_id
        {
            return self.handle_private_channel(&instance, &event).await;
        }

        let Some(task_id) = self.resolve_task(&instance, &event).await? else {
            return Ok(());
        };

        self.apply_event(&instance, &task_id, &event).await
    }

    /// Correlation priority: nonce, message id, referenced message id,
    /// then a prompt match among the instance's in-flight tasks.
    async fn resolve_task(
        &self,
        instance: &Arc<UpstreamInstance>,
        event: &EventData,
    ) -> Result<Option<String>> {
        if let Some(nonce) = &event.nonce {
            if let Some(task_id) = instance.task_by_nonce(nonce) {
                return Ok(Some(task_id));
            }
        }
        if let Some(task_id) = instance.task_by_message(&event.id) {
            return Ok(Some(task_id));
        }
        if let Some(referenced) = &event.referenced_message_id {
            if let Some(task_id) = instance.task_by_message(referenced) {
                return Ok(Some(task_id));
            }
        }

        let Some(parsed) = parse_content(&event.content) else {
            return Ok(None);
        };
        for task_id in instance.running_task_ids() {
            let Some(task) = self.store.get(&task_id).await? else {
                continue;
            };
            let candidate = task
                .properties
                .final_prompt
                .as_deref()
                .unwrap_or(task.prompt_en.as_str());
            if !candidate.is_empty()
                && (parsed.prompt == candidate || parsed.prompt.contains(candidate))
            {
                return Ok(Some(task_id));
            }
        }
        Ok(None)
    }

    async fn apply_event(
        &self,
        instance: &Arc<UpstreamInstance>,
        task_id: &str,
        event: &EventData,
    ) -> Result<()> {
        let _guard = self.locks.lock(task_id).await;
        let Some(mut task) = self.store.get(task_id).await? else {
            return Ok(());
        };
        // Terminal state is final; replays and stragglers are no-ops.
        if task.status.is_terminal() {
            return Ok(());
        }

        // The confirm window opening for a two-phase task.
        if task.properties.remix_modal && task.properties.remix_modal_message_id.is_none() {
            if let Some(meta) = &event.interaction_metadata {
                task.properties.remix_modal_message_id = Some(event.id.clone());
                task.properties.interaction_metadata_id = Some(meta.id.clone());
                instance.index_message(&event.id, task_id);
                return self.persist(&mut task).await;
            }
        }

        self.record_first_correlation(instance, &mut task, event);

        if let Some(reason) = failure_reason(event) {
            task.fail(reason);
            return self.persist(&mut task).await;
        }

        match task.action {
            TaskAction::Describe => {
                if let Some(embed) = event.embeds.iter().find(|e| !e.description.is_empty()) {
                    task.description = embed.description.clone();
                    if let Some(image) = event.first_image() {
                        task.image_url = Some(image.url.clone());
                    }
                    task.succeed();
                    return self.persist(&mut task).await;
                }
            }
            TaskAction::Shorten => {
                if event.content.contains("Shortened prompts") {
                    task.description = event.content.clone();
                    task.succeed();
                    return self.persist(&mut task).await;
                }
            }
            _ => {}
        }

        let waiting = event.content.contains(WAITING_MARKER);
        let stopped = event.content.contains(STOPPED_MARKER);

        if event.kind == MessageKind::Create && !waiting && !stopped {
            if let Some(image) = event.first_image() {
                if task.properties.message_hash.is_none() {
                    task.properties.message_hash = parse_message_hash(&image.url);
                }
                // The terminal message supersedes the send-time message id.
                task.properties.message_id = Some(event.id.clone());
                instance.index_message(&event.id, task_id);
                task.image_url = Some(image.url.clone());
                if !task.image_urls.contains(&image.url) {
                    task.image_urls.push(image.url.clone());
                }
                task.buttons = event.buttons();
                task.succeed();
                return self.persist(&mut task).await;
            }
        }

        // Render progress update.
        let mut changed = false;
        if let Some(caps) = PROGRESS_RE.captures(&event.content) {
            task.progress = format!("{}%", &caps[1]);
            changed = true;
        } else if waiting {
            task.progress = "0%".to_string();
            changed = true;
        }
        if let Some(image) = event.first_image() {
            if !task.image_urls.contains(&image.url) {
                task.image_urls.push(image.url.clone());
                task.image_url = Some(image.url.clone());
                changed = true;
            }
        }
        let buttons = event.buttons();
        if !buttons.is_empty() && buttons != task.buttons {
            task.buttons = buttons;
            changed = true;
        }
        if changed {
            return self.persist(&mut task).await;
        }
        Ok(())
    }

    /// Record message id, hash and final prompt the first time an event
    /// resolves to this task.
    fn record_first_correlation(
        &self,
        instance: &Arc<UpstreamInstance>,
        task: &mut Task,
        event: &EventData,
    ) {
        if task.properties.message_id.is_none() {
            task.properties.message_id = Some(event.id.clone());
            instance.index_message(&event.id, &task.id);
        }
        if task.properties.message_hash.is_none() {
            if let Some(image) = event.first_image() {
                task.properties.message_hash = parse_message_hash(&image.url);
            }
        }
        if task.properties.final_prompt.is_none() {
            if let Some(parsed) = parse_content(&event.content) {
                task.properties.final_prompt = Some(parsed.prompt);
            }
        }
    }

    /// Seed retrieval runs in the bot's private channel and writes onto
    /// already-finished tasks without changing their status.
    async fn handle_private_channel(
        &self,
        instance: &Arc<UpstreamInstance>,
        event: &EventData,
    ) -> Result<()> {
        for (hash, task_id) in instance.seed_waits() {
            let mentions_hash = event.content.contains(&hash)
                || event.embeds.iter().any(|e| {
                    e.description.contains(&hash) || e.title.contains(&hash)
                });
            if !mentions_hash {
                continue;
            }

            let _guard = self.locks.lock(&task_id).await;
            let Some(mut task) = self.store.get(&task_id).await? else {
                continue;
            };

            let seed = SEED_RE
                .captures(&event.content)
                .or_else(|| {
                    event
                        .embeds
                        .iter()
                        .find_map(|e| SEED_RE.captures(&e.description))
                })
                .map(|caps| caps[1].to_string());

            if let Some(seed) = seed {
                task.seed = Some(seed);
                instance.clear_seed_wait(&hash);
            } else if task.properties.seed_message_id.is_none() {
                task.properties.seed_message_id = Some(event.id.clone());
            } else {
                continue;
            }
            self.store.save(&task).await?;
            self.bus.publish(TaskNotice {
                task_id: task.id.clone(),
                status: task.status,
                progress: task.progress.clone(),
            });
            return Ok(());
        }
        Ok(())
    }

    /// Normalize a partner/official poll callback onto the same
    /// transition path as gateway events.
    pub async fn apply_poll_update(&self, update: PollUpdate) -> Result<()> {
        let Some(instance) = self.registry.by_channel(&update.instance_id) else {
            return Ok(());
        };
        let Some(task_id) = instance.task_by_nonce(&update.nonce) else {
            return Ok(());
        };

        let _guard = self.locks.lock(&task_id).await;
        let Some(mut task) = self.store.get(&task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        if !update.progress.is_empty() {
            task.progress = update.progress.clone();
        }
        if let Some(image_url) = &update.image_url {
            task.image_url = Some(image_url.clone());
            if !task.image_urls.contains(image_url) {
                task.image_urls.push(image_url.clone());
            }
        }
        if !update.buttons.is_empty() {
            task.buttons = update.buttons.clone();
        }
        match update.status {
            TaskStatus::Success => task.succeed(),
            TaskStatus::Failure => {
                task.fail(update.fail_reason.clone().unwrap_or_else(|| "failed".to_string()))
            }
            TaskStatus::Cancel => task.cancel(),
            _ => {}
        }
        self.persist(&mut task).await
    }

    async fn persist(&self, task: &mut Task) -> Result<()> {
        self.store.save(task).await?;
        debug!(
            "task {} -> {:?} ({})",
            task.id, task.status, task.progress
        );
        self.bus.publish(TaskNotice {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress.clone(),
        });
        Ok(())
    }
}

fn failure_reason(event: &EventData) -> Option<String> {
    for marker in FAILURE_MARKERS {
        if event.content.contains(marker) {
            return Some((*marker).to_string());
        }
    }
    for embed in &event.embeds {
        for marker in FAILURE_MARKERS {
            if embed.title.contains(marker) || embed.description.contains(marker) {
                let reason = if embed.description.is_empty() {
                    embed.title.clone()
                } else {
                    embed.description.clone()
                };
                return Some(reason);
            }
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_shapes_in_order() {
        let with_suffix = parse_content("**a red cube** - <@123> (fast)").unwrap();
        assert_eq!(with_suffix.prompt, "a red cube");
        assert_eq!(with_suffix.status, "fast");

        let variations = parse_content("**a red cube** - Variations by <@123> (relaxed)").unwrap();
        assert_eq!(variations.prompt, "a red cube");
        assert_eq!(variations.status, "relaxed");

        let strong = parse_content(
            "**a red cube** - Variations (Strong) by <@123> (fast)",
        )
        .unwrap();
        assert_eq!(strong.prompt, "a red cube");

        let progress = parse_content("**a red cube** - (31%) <@123> (fast)").unwrap();
        assert_eq!(progress.prompt, "a red cube");
        assert_eq!(progress.status, "fast");

        assert!(parse_content("plain message").is_none());
    }

    #[test]
    fn hash_parses_from_attachment_url() {
        let url = "https://cdn.example/attachments/1/2/user_a_red_cube_5f7a9c12-aa.png?ex=1";
        assert_eq!(parse_message_hash(url).as_deref(), Some("5f7a9c12-aa"));
        assert_eq!(
            parse_message_hash("https://cdn.example/plain.png").as_deref(),
            Some("plain")
        );
    }

    #[test]
    fn progress_and_seed_regexes() {
        assert_eq!(&PROGRESS_RE.captures("**p** - (46%) (fast)").unwrap()[1], "46");
        assert_eq!(&SEED_RE.captures("Seed: **12345**").unwrap()[1], "12345");
        assert_eq!(&SEED_RE.captures("seed 999").unwrap()[1], "999");
    }

    #[test]
    fn failure_markers_extract_reason() {
        let mut event = EventData {
            id: "e1".to_string(),
            author_id: "bot".to_string(),
            kind: MessageKind::Create,
            channel_id: "c1".to_string(),
            content: String::new(),
            attachments: Vec::new(),
            components: Vec::new(),
            embeds: Vec::new(),
            interaction_metadata: None,
            flags: 0,
            referenced_message_id: None,
            nonce: None,
        };
        assert!(failure_reason(&event).is_none());

        event.content = "Banned prompt detected".to_string();
        assert_eq!(failure_reason(&event).as_deref(), Some("Banned prompt"));

        event.content.clear();
        event.embeds.push(easel_types::Embed {
            title: "Invalid link".to_string(),
            description: "The link is not a valid image".to_string(),
        });
        assert_eq!(
            failure_reason(&event).as_deref(),
            Some("The link is not a valid image")
        );
    }
}
