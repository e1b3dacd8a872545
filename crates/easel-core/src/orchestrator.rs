// Task orchestrator.
// Public submit-* operations: preflight validation, account selection,
// uploads, compound command assembly, the button decision table and the
// two-phase modal path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use easel_store::{TaskOrder, TaskQuery, TaskStore};
use easel_types::custom_id::pan_modal_from_upsample;
use easel_types::{
    generate_nonce, AccountFilter, BackendFamily, BotFamily, ParsedCustomId, PicReaderTarget,
    SubmitResult, Task, TaskAction, TaskProperties, TaskStatus,
};

use crate::bus::{NotificationBus, TaskNotice};
use crate::caches::{BannedWordCache, DomainCache};
use crate::config::CoreConfig;
use crate::error::EaselError;
use crate::instance::{Producer, UpstreamInstance};
use crate::locks::KeyLockManager;
use crate::registry::AccountRegistry;
use crate::selector::{choose, Capability, SelectRequirements};
use crate::transport::{BlendDimensions, ImageHost, Message};
use crate::upload::resolve_image_refs;

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ImagineParams {
    pub prompt: String,
    /// Image references: http(s) links or base64 data URLs.
    pub images: Vec<String>,
    pub bot_family: Option<BotFamily>,
    pub filter: AccountFilter,
}

#[derive(Debug, Clone, Default)]
pub struct DescribeParams {
    pub image: String,
    pub bot_family: Option<BotFamily>,
    pub filter: AccountFilter,
}

#[derive(Debug, Clone)]
pub struct BlendParams {
    pub images: Vec<String>,
    pub dimensions: BlendDimensions,
    pub bot_family: Option<BotFamily>,
    pub filter: AccountFilter,
}

#[derive(Debug, Clone, Default)]
pub struct ShortenParams {
    pub prompt: String,
    pub bot_family: Option<BotFamily>,
    pub filter: AccountFilter,
}

/// Edit and retexture run on the partner/official backends only.
#[derive(Debug, Clone, Default)]
pub struct EditParams {
    pub image: String,
    pub prompt: String,
    pub filter: AccountFilter,
}

#[derive(Debug, Clone, Default)]
pub struct ActionParams {
    pub task_id: String,
    pub custom_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModalParams {
    pub task_id: String,
    /// Prompt typed into the confirm window, when the action takes one.
    pub prompt: Option<String>,
    /// Region mask for inpaint confirmations.
    pub mask_base64: Option<String>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct TaskOrchestrator {
    config: CoreConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<AccountRegistry>,
    domain_cache: DomainCache,
    banned_cache: BannedWordCache,
    locks: Arc<KeyLockManager>,
    bus: NotificationBus,
    host: Arc<dyn ImageHost>,
    select_calls: AtomicUsize,
}

impl TaskOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<AccountRegistry>,
        domain_store: Arc<dyn easel_store::DomainStore>,
        banned_store: Arc<dyn easel_store::BannedWordStore>,
        locks: Arc<KeyLockManager>,
        bus: NotificationBus,
        host: Arc<dyn ImageHost>,
    ) -> Self {
        let ttl = Duration::from_secs(config.dictionary_ttl_minutes * 60);
        Self {
            config,
            store,
            registry,
            domain_cache: DomainCache::new(domain_store, ttl),
            banned_cache: BannedWordCache::new(banned_store, ttl),
            locks,
            bus,
            host,
            select_calls: AtomicUsize::new(0),
        }
    }

    pub fn domain_cache(&self) -> &DomainCache {
        &self.domain_cache
    }

    pub fn banned_cache(&self) -> &BannedWordCache {
        &self.banned_cache
    }

    /// Number of selector invocations, exposed for scheduling telemetry.
    pub fn select_call_count(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Readback
    // ------------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> crate::Result<Option<Task>> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn list_tasks(
        &self,
        query: &TaskQuery,
        limit: Option<usize>,
    ) -> crate::Result<Vec<Task>> {
        Ok(self.store.list(query, TaskOrder::Id, true, limit).await?)
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    pub async fn submit_imagine(&self, params: ImagineParams) -> SubmitResult {
        let bot = self.resolve_bot(params.bot_family);
        match self.banned_word_hit(&params.prompt).await {
            Ok(Some(word)) => return SubmitResult::banned(word),
            Ok(None) => {}
            Err(e) => return submit_error(e),
        }

        let domain_ids = match self.detect_domain_ids(&params.prompt).await {
            Ok(ids) => ids,
            Err(e) => return submit_error(e),
        };

        let req = SelectRequirements {
            is_new_task: true,
            bot_family: Some(bot),
            preferred_mode: params.filter.modes.first().copied(),
            is_domain: !domain_ids.is_empty(),
            domain_ids,
            instance_ids: params.filter.instance_ids.clone(),
            ..SelectRequirements::default()
        };
        let Some(instance) = self.select_with_domain_retry(req) else {
            return SubmitResult::not_found("no available account instance");
        };

        let mut task = Task::new(TaskAction::Imagine, bot, instance.account().backend_family);
        task.prompt = params.prompt.clone();
        task.prompt_en = params.prompt.clone();
        task.account_filter = params.filter;
        task.properties.nonce = Some(generate_nonce());

        let ctx = instance.send_context(bot);
        let urls = match resolve_image_refs(
            instance.gateway().as_ref(),
            self.host.as_ref(),
            &self.config,
            &ctx,
            &params.images,
        )
        .await
        {
            Ok(urls) => urls,
            Err(e) => return submit_error(e),
        };
        let final_prompt = compound_prompt(&urls, &params.prompt);
        task.properties.final_prompt = Some(final_prompt.clone());
        task.description = format!("/imagine {final_prompt}");

        let sender = instance.gateway();
        let nonce = task.properties.nonce.clone().unwrap_or_default();
        let producer: Producer = Box::new(move || {
            Box::pin(async move { sender.imagine(&ctx, &final_prompt, &nonce).await })
        });
        instance.submit_task(&mut task, producer).await
    }

    pub async fn submit_describe(&self, params: DescribeParams) -> SubmitResult {
        let bot = self.resolve_bot(params.bot_family);
        let req = SelectRequirements {
            is_new_task: true,
            bot_family: Some(bot),
            capability: Some(Capability::Describe),
            preferred_mode: params.filter.modes.first().copied(),
            instance_ids: params.filter.instance_ids.clone(),
            ..SelectRequirements::default()
        };
        let Some(instance) = self.select_with_domain_retry(req) else {
            return SubmitResult::not_found("no available account instance");
        };

        let mut task = Task::new(TaskAction::Describe, bot, instance.account().backend_family);
        task.account_filter = params.filter;
        task.properties.nonce = Some(generate_nonce());

        let ctx = instance.send_context(bot);
        let urls = match resolve_image_refs(
            instance.gateway().as_ref(),
            self.host.as_ref(),
            &self.config,
            &ctx,
            std::slice::from_ref(&params.image),
        )
        .await
        {
            Ok(urls) => urls,
            Err(e) => return submit_error(e),
        };
        let link = urls.into_iter().next().unwrap_or_default();
        task.description = format!("/describe {link}");

        let sender = instance.gateway();
        let nonce = task.properties.nonce.clone().unwrap_or_default();
        let producer: Producer =
            Box::new(move || Box::pin(async move { sender.describe(&ctx, &link, &nonce).await }));
        instance.submit_task(&mut task, producer).await
    }

    pub async fn submit_blend(&self, params: BlendParams) -> SubmitResult {
        if params.images.len() < 2 || params.images.len() > 5 {
            return SubmitResult::validation_error("blend takes 2 to 5 images");
        }
        let bot = self.resolve_bot(params.bot_family);
        let req = SelectRequirements {
            is_new_task: true,
            bot_family: Some(bot),
            capability: Some(Capability::Blend),
            preferred_mode: params.filter.modes.first().copied(),
            instance_ids: params.filter.instance_ids.clone(),
            ..SelectRequirements::default()
        };
        let Some(instance) = self.select_with_domain_retry(req) else {
            return SubmitResult::not_found("no available account instance");
        };

        let mut task = Task::new(TaskAction::Blend, bot, instance.account().backend_family);
        task.account_filter = params.filter;
        task.properties.nonce = Some(generate_nonce());

        let ctx = instance.send_context(bot);
        let urls = match resolve_image_refs(
            instance.gateway().as_ref(),
            self.host.as_ref(),
            &self.config,
            &ctx,
            &params.images,
        )
        .await
        {
            Ok(urls) => urls,
            Err(e) => return submit_error(e),
        };
        task.description = format!("/blend {}", urls.join(" "));

        let sender = instance.gateway();
        let nonce = task.properties.nonce.clone().unwrap_or_default();
        let dimensions = params.dimensions;
        let producer: Producer = Box::new(move || {
            Box::pin(async move { sender.blend(&ctx, &urls, dimensions, &nonce).await })
        });
        instance.submit_task(&mut task, producer).await
    }

    pub async fn submit_shorten(&self, params: ShortenParams) -> SubmitResult {
        let bot = self.resolve_bot(params.bot_family);
        match self.banned_word_hit(&params.prompt).await {
            Ok(Some(word)) => return SubmitResult::banned(word),
            Ok(None) => {}
            Err(e) => return submit_error(e),
        }
        let req = SelectRequirements {
            is_new_task: true,
            bot_family: Some(bot),
            capability: Some(Capability::Shorten),
            preferred_mode: params.filter.modes.first().copied(),
            instance_ids: params.filter.instance_ids.clone(),
            ..SelectRequirements::default()
        };
        let Some(instance) = self.select_with_domain_retry(req) else {
            return SubmitResult::not_found("no available account instance");
        };

        let mut task = Task::new(TaskAction::Shorten, bot, instance.account().backend_family);
        task.prompt = params.prompt.clone();
        task.prompt_en = params.prompt.clone();
        task.account_filter = params.filter;
        task.properties.nonce = Some(generate_nonce());
        task.description = format!("/shorten {}", params.prompt);

        let ctx = instance.send_context(bot);
        let sender = instance.gateway();
        let nonce = task.properties.nonce.clone().unwrap_or_default();
        let prompt = params.prompt;
        let producer: Producer =
            Box::new(move || Box::pin(async move { sender.shorten(&ctx, &prompt, &nonce).await }));
        instance.submit_task(&mut task, producer).await
    }

    /// Re-materialize a finished upstream job by id.
    pub async fn submit_show(&self, job_id: String, filter: AccountFilter) -> SubmitResult {
        let req = SelectRequirements {
            is_new_task: true,
            preferred_mode: filter.modes.first().copied(),
            instance_ids: filter.instance_ids.clone(),
            ..SelectRequirements::default()
        };
        let Some(instance) = self.select_with_domain_retry(req) else {
            return SubmitResult::not_found("no available account instance");
        };

        let mut task = Task::new(
            TaskAction::Show,
            BotFamily::Mj,
            instance.account().backend_family,
        );
        task.account_filter = filter;
        task.properties.nonce = Some(generate_nonce());
        task.description = format!("/show {job_id}");

        let ctx = instance.send_context(BotFamily::Mj);
        let sender = instance.gateway();
        let nonce = task.properties.nonce.clone().unwrap_or_default();
        let producer: Producer =
            Box::new(move || Box::pin(async move { sender.show(&ctx, &job_id, &nonce).await }));
        instance.submit_task(&mut task, producer).await
    }

    pub async fn submit_edit(&self, params: EditParams) -> SubmitResult {
        self.submit_compound(TaskAction::Edit, params).await
    }

    pub async fn submit_retexture(&self, params: EditParams) -> SubmitResult {
        self.submit_compound(TaskAction::Retexture, params).await
    }

    /// Compound image+prompt commands that only the partner/official
    /// backends implement.
    async fn submit_compound(&self, action: TaskAction, params: EditParams) -> SubmitResult {
        match self.banned_word_hit(&params.prompt).await {
            Ok(Some(word)) => return SubmitResult::banned(word),
            Ok(None) => {}
            Err(e) => return submit_error(e),
        }
        let req = SelectRequirements {
            is_new_task: true,
            preferred_mode: params.filter.modes.first().copied(),
            instance_ids: params.filter.instance_ids.clone(),
            backends: vec![BackendFamily::Partner, BackendFamily::Official],
            ..SelectRequirements::default()
        };
        let Some(instance) = self.select_with_domain_retry(req) else {
            return SubmitResult::not_found("no available partner or official account");
        };

        let mut task = Task::new(action, BotFamily::Mj, instance.account().backend_family);
        task.prompt = params.prompt.clone();
        task.prompt_en = params.prompt.clone();
        task.account_filter = params.filter;
        task.properties.nonce = Some(generate_nonce());

        let ctx = instance.send_context(BotFamily::Mj);
        let urls = match resolve_image_refs(
            instance.gateway().as_ref(),
            self.host.as_ref(),
            &self.config,
            &ctx,
            std::slice::from_ref(&params.image),
        )
        .await
        {
            Ok(urls) => urls,
            Err(e) => return submit_error(e),
        };
        let final_prompt = compound_prompt(&urls, &params.prompt);
        task.properties.final_prompt = Some(final_prompt.clone());

        let sender = instance.gateway();
        let nonce = task.properties.nonce.clone().unwrap_or_default();
        let producer: Producer = Box::new(move || {
            Box::pin(async move { sender.imagine(&ctx, &final_prompt, &nonce).await })
        });
        instance.submit_task(&mut task, producer).await
    }

    // ------------------------------------------------------------------
    // Button actions
    // ------------------------------------------------------------------

    pub async fn submit_action(&self, params: ActionParams) -> SubmitResult {
        let parent = match self.store.get(&params.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return SubmitResult::not_found("task not found"),
            Err(e) => return submit_error(e.into()),
        };
        let Some(instance) = self
            .registry
            .by_channel(parent.instance_id.as_deref().unwrap_or_default())
        else {
            return SubmitResult::not_found("instance not available");
        };
        let account = instance.account();

        let Some(parsed) = ParsedCustomId::parse(&params.custom_id) else {
            // Manual video and other unparsed buttons.
            if params.custom_id.to_lowercase().contains("video") {
                if !self.config.enable_video {
                    return SubmitResult::validation_error("video is disabled");
                }
                return self
                    .modal_entry(&parent, TaskAction::Video, &params.custom_id, None)
                    .await;
            }
            return self
                .submit_click(&instance, &parent, TaskAction::Action, &params.custom_id)
                .await;
        };

        match parsed {
            ParsedCustomId::Bookmark { .. } => {
                // Fire-and-forget; no child task.
                let sender = instance.gateway();
                let ctx = instance.send_context(parent.bot_family);
                let message_id = parent.properties.message_id.clone().unwrap_or_default();
                let custom_id = params.custom_id.clone();
                let flags = parent.properties.flags;
                tokio::spawn(async move {
                    if let Err(e) = sender
                        .action(&ctx, &message_id, &custom_id, flags, &generate_nonce())
                        .await
                    {
                        warn!("bookmark action failed: {e}");
                    }
                });
                SubmitResult::success(parent.id.clone())
            }
            ParsedCustomId::HighVariabilityMode { enabled } => {
                let sender = instance.gateway();
                let ctx = instance.send_context(parent.bot_family);
                let message_id = parent.properties.message_id.clone().unwrap_or_default();
                let result = sender
                    .setting_button(&ctx, &message_id, &params.custom_id, &generate_nonce())
                    .await;
                match result {
                    Ok(message) if message.is_accepted() => {
                        instance.set_high_variability(!enabled);
                        SubmitResult::success(parent.id.clone())
                    }
                    Ok(message) => SubmitResult::failure(message.description),
                    Err(e) => submit_error(e),
                }
            }
            ParsedCustomId::CustomZoom { .. } => {
                self.modal_entry(&parent, TaskAction::Zoom, &params.custom_id, None)
                    .await
            }
            ParsedCustomId::Inpaint { .. } => {
                self.modal_entry(&parent, TaskAction::Inpaint, &params.custom_id, None)
                    .await
            }
            ParsedCustomId::PicReader { target } => match target {
                PicReaderTarget::All => self.fan_out_pic_reader(&parent, &params.custom_id).await,
                PicReaderTarget::Index(index) => {
                    let Some(prompt) = numbered_prompt(&parent.description, index) else {
                        return SubmitResult::not_found("prompt not found");
                    };
                    self.modal_entry(&parent, TaskAction::Imagine, &params.custom_id, Some(prompt))
                        .await
                }
            },
            ParsedCustomId::PromptAnalyzer { index } => {
                let Some(prompt) = shortened_prompt(&parent.description, index) else {
                    return SubmitResult::not_found("prompt not found");
                };
                self.modal_entry(&parent, TaskAction::Imagine, &params.custom_id, Some(prompt))
                    .await
            }
            ParsedCustomId::Upsample { .. } => {
                self.submit_click(&instance, &parent, TaskAction::Upscale, &params.custom_id)
                    .await
            }
            ParsedCustomId::Pan { .. } => {
                self.remix_or_click(&instance, &account, &parent, TaskAction::Pan, &params.custom_id)
                    .await
            }
            ParsedCustomId::Variation { .. } | ParsedCustomId::VariationStrength { .. } => {
                self.remix_or_click(
                    &instance,
                    &account,
                    &parent,
                    TaskAction::Variation,
                    &params.custom_id,
                )
                .await
            }
            ParsedCustomId::Reroll { .. } => {
                self.remix_or_click(
                    &instance,
                    &account,
                    &parent,
                    TaskAction::Reroll,
                    &params.custom_id,
                )
                .await
            }
            ParsedCustomId::RemixModal { .. }
            | ParsedCustomId::PanModal { .. }
            | ParsedCustomId::ImagineModal { .. } => {
                SubmitResult::validation_error("modal custom ids are not user actions")
            }
        }
    }

    /// PAN / VARIATION / REROLL honor the account's remix toggle.
    async fn remix_or_click(
        &self,
        instance: &Arc<UpstreamInstance>,
        account: &easel_types::Account,
        parent: &Task,
        action: TaskAction,
        custom_id: &str,
    ) -> SubmitResult {
        let remix = parent
            .account_filter
            .remix
            .unwrap_or_else(|| account.remix_enabled(parent.bot_family));
        if !remix {
            return self.submit_click(instance, parent, action, custom_id).await;
        }

        let child = self.modal_child(parent, action, custom_id, None);
        if account.remix_auto_submit {
            if let Err(e) = self.store.save(&child).await {
                return submit_error(e.into());
            }
            return self
                .submit_modal(ModalParams {
                    task_id: child.id.clone(),
                    prompt: None,
                    mask_base64: None,
                })
                .await;
        }
        self.persist_modal_entry(child).await
    }

    /// Plain button click: a normal child submission through the queue.
    async fn submit_click(
        &self,
        instance: &Arc<UpstreamInstance>,
        parent: &Task,
        action: TaskAction,
        custom_id: &str,
    ) -> SubmitResult {
        let mut child = parent.spawn_child(action);
        child.prompt = parent.prompt.clone();
        child.prompt_en = parent.prompt_en.clone();
        child.properties.custom_id = Some(custom_id.to_string());
        child.properties.flags = parent.properties.flags;
        child.properties.final_prompt = parent.properties.final_prompt.clone();
        child.properties.nonce = Some(generate_nonce());

        let ctx = instance.send_context(parent.bot_family);
        let sender = instance.gateway();
        let message_id = parent.properties.message_id.clone().unwrap_or_default();
        let parsed = ParsedCustomId::parse(custom_id);
        let custom_id = custom_id.to_string();
        let flags = parent.properties.flags;
        let nonce = child.properties.nonce.clone().unwrap_or_default();
        let producer: Producer = Box::new(move || {
            Box::pin(async move {
                // Grid buttons have dedicated primitives; everything else
                // goes through the generic interaction.
                match parsed {
                    Some(ParsedCustomId::Upsample { index, hash }) => {
                        sender
                            .upscale(&ctx, &message_id, index, &hash, flags, &nonce)
                            .await
                    }
                    Some(ParsedCustomId::Variation { index, hash }) => {
                        sender
                            .variation(&ctx, &message_id, index, &hash, flags, &nonce)
                            .await
                    }
                    Some(ParsedCustomId::Reroll { hash }) => {
                        sender.reroll(&ctx, &message_id, &hash, flags, &nonce).await
                    }
                    _ => {
                        sender
                            .action(&ctx, &message_id, &custom_id, flags, &nonce)
                            .await
                    }
                }
            })
        });
        instance.submit_task(&mut child, producer).await
    }

    /// Up to four independent MODAL submits, one per described prompt.
    async fn fan_out_pic_reader(&self, parent: &Task, custom_id: &str) -> SubmitResult {
        let mut task_ids = Vec::new();
        for index in 1..=4u8 {
            let Some(prompt) = numbered_prompt(&parent.description, index) else {
                break;
            };
            let child = self.modal_child(parent, TaskAction::Imagine, custom_id, Some(prompt));
            if let Err(e) = self.store.save(&child).await {
                return submit_error(e.into());
            }
            let result = self
                .submit_modal(ModalParams {
                    task_id: child.id.clone(),
                    prompt: None,
                    mask_base64: None,
                })
                .await;
            if !matches!(
                result.code,
                easel_types::SubmitCode::Success | easel_types::SubmitCode::InQueue
            ) {
                return result;
            }
            task_ids.push(child.id);
        }
        if task_ids.is_empty() {
            return SubmitResult::not_found("prompt not found");
        }
        let mut result = SubmitResult::success(task_ids.join(","));
        result.description = format!("{} tasks submitted", task_ids.len());
        result
    }

    fn modal_child(
        &self,
        parent: &Task,
        action: TaskAction,
        custom_id: &str,
        final_prompt: Option<String>,
    ) -> Task {
        let mut child = parent.spawn_child(action);
        child.status = TaskStatus::Modal;
        child.prompt = parent.prompt.clone();
        child.prompt_en = parent.prompt_en.clone();
        child.properties = TaskProperties {
            nonce: Some(generate_nonce()),
            message_id: parent.properties.message_id.clone(),
            flags: parent.properties.flags,
            custom_id: Some(custom_id.to_string()),
            final_prompt: final_prompt.or_else(|| parent.properties.final_prompt.clone()),
            remix_custom_id: parent.properties.remix_custom_id.clone(),
            remix_u_custom_id: if parent.action == TaskAction::Upscale {
                parent.properties.custom_id.clone()
            } else {
                parent.properties.remix_u_custom_id.clone()
            },
            remix_modal: true,
            ..TaskProperties::default()
        };
        child
    }

    async fn modal_entry(
        &self,
        parent: &Task,
        action: TaskAction,
        custom_id: &str,
        final_prompt: Option<String>,
    ) -> SubmitResult {
        let child = self.modal_child(parent, action, custom_id, final_prompt);
        self.persist_modal_entry(child).await
    }

    async fn persist_modal_entry(&self, child: Task) -> SubmitResult {
        if let Err(e) = self.store.save(&child).await {
            return submit_error(e.into());
        }
        self.bus.publish(TaskNotice {
            task_id: child.id.clone(),
            status: child.status,
            progress: child.progress.clone(),
        });
        let final_prompt = child.properties.final_prompt.clone().unwrap_or_default();
        SubmitResult::existed(child.id, "Waiting for window confirm")
            .with_property("finalPrompt", final_prompt)
            .with_property("remix", true)
    }

    // ------------------------------------------------------------------
    // Modal two-phase submit
    // ------------------------------------------------------------------

    pub async fn submit_modal(&self, params: ModalParams) -> SubmitResult {
        let mut task = {
            let _guard = self.locks.lock(&params.task_id).await;
            let mut task = match self.store.get(&params.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => return SubmitResult::not_found("task not found"),
                Err(e) => return submit_error(e.into()),
            };
            match task.status {
                // The one allowed bounce: MODAL back to NOT_START.
                TaskStatus::Modal => task.status = TaskStatus::NotStart,
                TaskStatus::NotStart => {}
                _ => return SubmitResult::existed(task.id.clone(), "task already submitted"),
            }
            if let Some(prompt) = &params.prompt {
                match self.banned_word_hit(prompt).await {
                    Ok(Some(word)) => return SubmitResult::banned(word),
                    Ok(None) => {}
                    Err(e) => return submit_error(e),
                }
                task.properties.final_prompt = Some(prompt.clone());
            }
            if let Err(e) = self.store.save(&task).await {
                return submit_error(e.into());
            }
            task
        };

        let instance = match self
            .registry
            .by_channel(task.instance_id.as_deref().unwrap_or_default())
        {
            Some(instance) => instance,
            None => {
                let req = SelectRequirements {
                    is_new_task: false,
                    bot_family: Some(task.bot_family),
                    preferred_mode: task.account_filter.modes.first().copied(),
                    instance_ids: task.account_filter.instance_ids.clone(),
                    ..SelectRequirements::default()
                };
                match self.select_with_domain_retry(req) {
                    Some(instance) => instance,
                    None => return SubmitResult::not_found("instance not available"),
                }
            }
        };

        let Some(custom_id) = task.properties.custom_id.clone() else {
            return SubmitResult::validation_error("task has no confirm window");
        };
        let parsed = ParsedCustomId::parse(&custom_id);
        let account = instance.account();
        let remix_custom_id = rewrite_remix_custom_id(
            parsed.as_ref(),
            &task.properties,
            account.high_variability,
        );
        task.properties.remix_custom_id = remix_custom_id.clone();

        let ctx = instance.send_context(task.bot_family);
        let sender = instance.gateway();
        let store = self.store.clone();
        let task_id = task.id.clone();
        let message_id = task.properties.message_id.clone().unwrap_or_default();
        let flags = task.properties.flags;
        let nonce = task
            .properties
            .nonce
            .get_or_insert_with(generate_nonce)
            .clone();
        let final_prompt = task.properties.final_prompt.clone().unwrap_or_default();
        let mask = params.mask_base64.clone().unwrap_or_default();
        let poll_interval = Duration::from_millis(self.config.modal_poll_interval_ms);
        let poll_timeout = Duration::from_secs(self.config.modal_timeout_secs);
        let confirm_delay = Duration::from_millis(self.config.modal_confirm_delay_ms);

        let producer: Producer = Box::new(move || {
            Box::pin(async move {
                // Phase one: open the confirm window.
                let first = sender
                    .action(&ctx, &message_id, &custom_id, flags, &nonce)
                    .await?;
                if !first.is_accepted() {
                    return Ok(first);
                }

                // Wait for the correlator to record the window ids.
                let deadline = Instant::now() + poll_timeout;
                let (modal_message_id, interaction_id) = loop {
                    if let Some(task) = store.get(&task_id).await? {
                        if let (Some(modal), Some(interaction)) = (
                            task.properties.remix_modal_message_id.clone(),
                            task.properties.interaction_metadata_id.clone(),
                        ) {
                            break (modal, interaction);
                        }
                    }
                    if Instant::now() >= deadline {
                        return Ok(Message::of(Message::NOT_FOUND, "timeout"));
                    }
                    tokio::time::sleep(poll_interval).await;
                };
                tokio::time::sleep(confirm_delay).await;

                // Phase two: submit inside the window.
                match parsed {
                    Some(ParsedCustomId::CustomZoom { .. }) => {
                        sender
                            .zoom(&ctx, &modal_message_id, &custom_id, &final_prompt, &nonce)
                            .await
                    }
                    Some(ParsedCustomId::Inpaint { .. }) => {
                        sender
                            .inpaint(&ctx, &interaction_id, &custom_id, &final_prompt, &mask)
                            .await
                    }
                    Some(ParsedCustomId::PicReader { .. })
                    | Some(ParsedCustomId::PromptAnalyzer { .. }) => {
                        sender
                            .pic_reader(&ctx, &modal_message_id, &custom_id, &final_prompt, &nonce)
                            .await
                    }
                    _ => {
                        let Some(remix_id) = remix_custom_id else {
                            return Ok(Message::of(0, "no remix custom id"));
                        };
                        sender
                            .remix(&ctx, &modal_message_id, &remix_id, &final_prompt, &nonce)
                            .await
                    }
                }
            })
        });

        instance.submit_task(&mut task, producer).await
    }

    // ------------------------------------------------------------------
    // Seed retrieval
    // ------------------------------------------------------------------

    pub async fn get_seed(&self, task_id: &str) -> SubmitResult {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return SubmitResult::not_found("task not found"),
            Err(e) => return submit_error(e.into()),
        };
        if let Some(seed) = &task.seed {
            return SubmitResult::success(task.id.clone()).with_property("seed", seed.clone());
        }
        let Some(hash) = task.properties.message_hash.clone() else {
            return SubmitResult::validation_error("task has no image hash");
        };
        let Some(instance) = self
            .registry
            .by_channel(task.instance_id.as_deref().unwrap_or_default())
        else {
            return SubmitResult::not_found("instance not available");
        };
        let account = instance.account();
        let private_channel = account.private_channel_for(task.bot_family).to_string();
        if private_channel.is_empty() {
            return SubmitResult::validation_error("account has no private channel");
        }

        instance.register_seed_wait(&hash, &task.id);
        let ctx = instance.send_context(task.bot_family);
        let sender = instance.gateway();
        match sender.seed(&ctx, &private_channel, &hash, &generate_nonce()).await {
            Ok(message) if message.is_accepted() => {}
            Ok(message) => {
                instance.clear_seed_wait(&hash);
                return SubmitResult::failure(message.description);
            }
            Err(e) => {
                instance.clear_seed_wait(&hash);
                return submit_error(e);
            }
        }

        let timeout = Duration::from_secs(self.config.seed_timeout_secs);
        let deadline = Instant::now() + timeout;
        let seed_message_id = loop {
            if let Ok(Some(task)) = self.store.get(task_id).await {
                if let Some(seed_message_id) = task.properties.seed_message_id {
                    break seed_message_id;
                }
            }
            // Fallback sweep of the private channel for gateways that do
            // not push direct-message events.
            if let Ok(events) = sender.seed_messages(&ctx, &private_channel).await {
                let found = events.iter().find(|event| {
                    event.content.contains(&hash)
                        || event.embeds.iter().any(|e| {
                            e.description.contains(&hash) || e.title.contains(&hash)
                        })
                });
                if let Some(event) = found {
                    let _guard = self.locks.lock(task_id).await;
                    if let Ok(Some(mut task)) = self.store.get(task_id).await {
                        if task.properties.seed_message_id.is_none() {
                            task.properties.seed_message_id = Some(event.id.clone());
                            let _ = self.store.save(&task).await;
                        }
                    }
                    break event.id.clone();
                }
            }
            if Instant::now() >= deadline {
                instance.clear_seed_wait(&hash);
                return SubmitResult::not_found("timeout");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        };

        if let Err(e) = sender
            .reaction(&ctx, &private_channel, &seed_message_id, "✉️")
            .await
        {
            instance.clear_seed_wait(&hash);
            return submit_error(e);
        }

        let Some(seed) = self.poll_task(task_id, timeout, |t| t.seed.clone()).await else {
            instance.clear_seed_wait(&hash);
            return SubmitResult::not_found("timeout");
        };
        SubmitResult::success(task_id.to_string()).with_property("seed", seed)
    }

    async fn poll_task<T>(
        &self,
        task_id: &str,
        timeout: Duration,
        extract: impl Fn(&Task) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(task)) = self.store.get(task_id).await {
                if let Some(value) = extract(&task) {
                    return Some(value);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    // ------------------------------------------------------------------
    // Cancel & account maintenance
    // ------------------------------------------------------------------

    pub async fn cancel(&self, task_id: &str) -> SubmitResult {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return SubmitResult::not_found("task not found"),
            Err(e) => return submit_error(e.into()),
        };
        if task.status.is_terminal() {
            return SubmitResult::validation_error("task already finished");
        }
        if let Some(instance) = self
            .registry
            .by_channel(task.instance_id.as_deref().unwrap_or_default())
        {
            return match instance.cancel_task(task_id).await {
                Ok(true) => SubmitResult::success(task_id.to_string()),
                Ok(false) => SubmitResult::validation_error("task already finished"),
                Err(e) => submit_error(e),
            };
        }
        // Not yet owned by an instance (NOT_START / MODAL).
        let _guard = self.locks.lock(task_id).await;
        let Ok(Some(mut task)) = self.store.get(task_id).await else {
            return SubmitResult::not_found("task not found");
        };
        if task.status.is_terminal() {
            return SubmitResult::validation_error("task already finished");
        }
        task.cancel();
        if let Err(e) = self.store.save(&task).await {
            return submit_error(e.into());
        }
        self.bus.publish(TaskNotice {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress.clone(),
        });
        SubmitResult::success(task_id.to_string())
    }

    /// Refresh the account's upstream state: `/info` per enabled bot and
    /// the settings grid. Single-flight per account.
    pub async fn refresh_account(&self, channel_id: &str) -> SubmitResult {
        let Some(_guard) = self.locks.try_lock(&format!("account-action:{channel_id}")) else {
            return SubmitResult::failure("account action in flight");
        };
        let Some(instance) = self.registry.by_channel(channel_id) else {
            return SubmitResult::not_found("instance not available");
        };
        let account = instance.account();
        let sender = instance.gateway();

        let ctx = instance.send_context(BotFamily::Mj);
        if let Err(e) = sender.info(&ctx, &generate_nonce()).await {
            return submit_error(e);
        }
        if account.enable_niji {
            let ctx = instance.send_context(BotFamily::Niji);
            if let Err(e) = sender.info(&ctx, &generate_nonce()).await {
                return submit_error(e);
            }
        }
        let ctx = instance.send_context(BotFamily::Mj);
        if let Err(e) = sender.setting(&ctx, &generate_nonce()).await {
            return submit_error(e);
        }
        SubmitResult::success(channel_id.to_string())
    }

    /// Drive one option of the settings grid (select menus).
    pub async fn select_setting_option(
        &self,
        channel_id: &str,
        message_id: &str,
        custom_id: &str,
        value: &str,
    ) -> SubmitResult {
        let Some(instance) = self.registry.by_channel(channel_id) else {
            return SubmitResult::not_found("instance not available");
        };
        let ctx = instance.send_context(BotFamily::Mj);
        match instance
            .gateway()
            .setting_select(&ctx, message_id, custom_id, value, &generate_nonce())
            .await
        {
            Ok(message) if message.is_accepted() => SubmitResult::success(channel_id.to_string()),
            Ok(message) => SubmitResult::failure(message.description),
            Err(e) => submit_error(e),
        }
    }

    // ------------------------------------------------------------------
    // Preflight helpers
    // ------------------------------------------------------------------

    fn resolve_bot(&self, requested: Option<BotFamily>) -> BotFamily {
        match requested.unwrap_or(BotFamily::Mj) {
            BotFamily::Niji if self.config.enable_convert_niji_to_mj => BotFamily::Mj,
            bot => bot,
        }
    }

    /// Word-boundary scan of the prompt against the enabled banned-word
    /// sets; returns the offending substring as the caller wrote it.
    async fn banned_word_hit(&self, prompt: &str) -> crate::Result<Option<String>> {
        let sets = self.banned_cache.get().await?;
        for set in sets {
            for keyword in &set.keywords {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
                let Ok(re) = regex::Regex::new(&pattern) else {
                    continue;
                };
                if let Some(found) = re.find(prompt) {
                    return Ok(Some(found.as_str().to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Tokenize the prompt and collect the enabled domain sets it hits.
    async fn detect_domain_ids(&self, prompt: &str) -> crate::Result<Vec<String>> {
        if !self.config.enable_vertical_domain {
            return Ok(Vec::new());
        }
        let tags = self.domain_cache.get().await?;
        let lowered = prompt.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split([',', '.', '-', ' ', '\t', '\n'])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();

        let mut domain_ids = Vec::new();
        for tag in tags {
            let hit = tokens.iter().any(|token| {
                tag.keywords.contains(*token) || tag.keywords.contains(&format!("{token}s"))
            });
            if hit {
                domain_ids.push(tag.id);
            }
        }
        Ok(domain_ids)
    }

    fn select_instance(&self, req: &SelectRequirements) -> Option<Arc<UpstreamInstance>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        choose(&self.registry, &self.config, req)
    }

    /// Domain-scoped selection retries exactly once with the domain
    /// filter disabled.
    fn select_with_domain_retry(&self, mut req: SelectRequirements) -> Option<Arc<UpstreamInstance>> {
        match self.select_instance(&req) {
            Some(instance) => Some(instance),
            None if req.is_domain => {
                debug!("domain-scoped selection empty, retrying without domain");
                req.is_domain = false;
                self.select_instance(&req)
            }
            None => None,
        }
    }
}

// ============================================================================
// Free helpers
// ============================================================================

/// Compound commands prepend resolved image URLs, space-separated.
fn compound_prompt(urls: &[String], prompt: &str) -> String {
    if urls.is_empty() {
        prompt.to_string()
    } else {
        format!("{} {}", urls.join(" "), prompt)
    }
}

fn submit_error(e: EaselError) -> SubmitResult {
    match e {
        EaselError::BannedPrompt(word) => SubmitResult::banned(word),
        EaselError::Validation(message) => SubmitResult::validation_error(message),
        EaselError::NotFound(message) => SubmitResult::not_found(message),
        other => SubmitResult::failure(other.to_string()),
    }
}

/// Remix custom-id rewrite rules for the modal second phase.
fn rewrite_remix_custom_id(
    parsed: Option<&ParsedCustomId>,
    props: &TaskProperties,
    high_variability: bool,
) -> Option<String> {
    match parsed {
        Some(ParsedCustomId::Pan {
            direction,
            index,
            hash,
        }) => Some(format!("MJ::PanModal::{direction}::{hash}::{index}")),
        Some(ParsedCustomId::VariationStrength { high, index, hash }) => Some(format!(
            "MJ::RemixModal::{hash}::{index}::{}",
            u8::from(*high)
        )),
        Some(ParsedCustomId::Variation { index, hash }) => Some(format!(
            "MJ::RemixModal::{hash}::{index}::{}",
            u8::from(high_variability)
        )),
        _ => {
            // Re-rolls reuse the recorded remix id; a previous PanModal is
            // re-synthesized from the parent's upsample custom id.
            if let Some(previous) = &props.remix_custom_id {
                if let Some(ParsedCustomId::PanModal { direction, .. }) =
                    ParsedCustomId::parse(previous)
                {
                    if let Some(u_custom_id) = &props.remix_u_custom_id {
                        return pan_modal_from_upsample(direction, u_custom_id)
                            .or_else(|| Some(previous.clone()));
                    }
                }
                return Some(previous.clone());
            }
            props
                .message_id
                .as_ref()
                .map(|message_id| format!("MJ::ImagineModal::{message_id}"))
        }
    }
}

/// Numbered prompt lines, e.g. a describe result: `1️⃣ a cat ...`.
fn numbered_prompt(description: &str, index: u8) -> Option<String> {
    numbered_lines(description).into_iter().nth(index.checked_sub(1)? as usize)
}

/// The N-th line under the "Shortened prompts" anchor; absence of the
/// anchor yields nothing rather than falling through to raw lines.
fn shortened_prompt(description: &str, index: u8) -> Option<String> {
    let (_, after) = description.split_once("Shortened prompts")?;
    numbered_lines(after).into_iter().nth(index.checked_sub(1)? as usize)
}

/// Strip the leading emoji/number token from each numbered line.
fn numbered_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let token = parts.next()?;
            if !token.chars().any(|c| c.is_ascii_digit()) {
                return None;
            }
            let rest = parts.next()?.trim();
            if rest.is_empty() {
                None
            } else {
                Some(rest.to_string())
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
