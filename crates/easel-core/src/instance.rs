// Upstream account instance.
// One per account: bounded per-mode FIFO queues feeding a worker pool of
// `core_size`, a running-task index, and the pacing clock that spaces
// command sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Local, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use easel_store::TaskStore;
use easel_types::{Account, AccountFilter, SpeedMode, SubmitResult, Task, TaskStatus};

use crate::bus::{NotificationBus, TaskNotice};
use crate::locks::KeyLockManager;
use crate::transport::{GatewaySender, Message, SendContext};

/// Deferred backend command run by a worker once the task is dequeued.
pub type Producer = Box<dyn FnOnce() -> BoxFuture<'static, crate::Result<Message>> + Send>;

const MODES: [SpeedMode; 3] = [SpeedMode::Turbo, SpeedMode::Fast, SpeedMode::Relax];

/// A send burst ends after this much idle time; the next send waits the
/// account's leading `interval` again.
const BURST_IDLE_GAP: Duration = Duration::from_secs(30);

struct QueuedJob {
    task_id: String,
    producer: Producer,
}

struct ModeQueue {
    tx: mpsc::Sender<QueuedJob>,
    queued: Arc<AtomicUsize>,
}

pub struct UpstreamInstance {
    account: RwLock<Account>,
    sender: Arc<dyn GatewaySender>,
    store: Arc<dyn TaskStore>,
    locks: Arc<KeyLockManager>,
    bus: NotificationBus,
    queues: HashMap<SpeedMode, ModeQueue>,
    /// task id -> mode, for every task between dequeue and terminal.
    running: RwLock<HashMap<String, SpeedMode>>,
    by_nonce: RwLock<HashMap<String, String>>,
    by_message_id: RwLock<HashMap<String, String>>,
    /// image hash -> task id awaiting a seed in the private channel.
    seed_waits: RwLock<HashMap<String, String>>,
    running_count: AtomicUsize,
    connected: AtomicBool,
    accepting: AtomicBool,
    /// Serializes the queue-gate check against concurrent submits.
    submit_gate: Mutex<()>,
    /// Pacing clock: the instant of the last completed send.
    last_send: tokio::sync::Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl UpstreamInstance {
    /// Build the instance and spawn its dispatchers and worker pool.
    pub fn start(
        account: Account,
        sender: Arc<dyn GatewaySender>,
        store: Arc<dyn TaskStore>,
        locks: Arc<KeyLockManager>,
        bus: NotificationBus,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(account.core_size.max(1)));

        let mut queues = HashMap::new();
        let mut receivers = Vec::new();
        for mode in MODES {
            let capacity = account.queue_size_for(mode).max(1);
            let (tx, rx) = mpsc::channel(capacity);
            queues.insert(
                mode,
                ModeQueue {
                    tx,
                    queued: Arc::new(AtomicUsize::new(0)),
                },
            );
            receivers.push((mode, rx));
        }

        let instance = Arc::new(Self {
            account: RwLock::new(account),
            sender,
            store,
            locks,
            bus,
            queues,
            running: RwLock::new(HashMap::new()),
            by_nonce: RwLock::new(HashMap::new()),
            by_message_id: RwLock::new(HashMap::new()),
            seed_waits: RwLock::new(HashMap::new()),
            running_count: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            submit_gate: Mutex::new(()),
            last_send: tokio::sync::Mutex::new(None),
            cancel,
        });

        // One dispatcher per mode keeps dequeue order FIFO within the mode
        // while the shared semaphore bounds concurrency to core_size.
        for (mode, mut rx) in receivers {
            let instance = instance.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = instance.cancel.cancelled() => break,
                        job = rx.recv() => match job {
                            Some(job) => job,
                            None => break,
                        },
                    };
                    let permit = tokio::select! {
                        _ = instance.cancel.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    // A popped job keeps its queue slot until a worker
                    // permit frees up.
                    instance.queue(mode).queued.fetch_sub(1, Ordering::SeqCst);
                    let worker = instance.clone();
                    tokio::spawn(async move {
                        worker.run_job(mode, job).await;
                        drop(permit);
                    });
                }
            });
        }

        instance
    }

    fn queue(&self, mode: SpeedMode) -> &ModeQueue {
        self.queues.get(&mode).expect("all modes have queues")
    }

    // ------------------------------------------------------------------
    // Account view
    // ------------------------------------------------------------------

    pub fn account(&self) -> Account {
        self.account.read().clone()
    }

    pub fn channel_id(&self) -> String {
        self.account.read().channel_id.clone()
    }

    pub fn update_account(&self, account: Account) {
        *self.account.write() = account;
    }

    pub fn set_high_variability(&self, enabled: bool) {
        self.account.write().high_variability = enabled;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn send_context(&self, bot_family: easel_types::BotFamily) -> SendContext {
        let account = self.account.read();
        SendContext {
            channel_id: account.channel_id.clone(),
            guild_id: account.guild_id.clone(),
            bot_family,
            backend_family: account.backend_family,
        }
    }

    pub fn gateway(&self) -> Arc<dyn GatewaySender> {
        self.sender.clone()
    }

    /// Enabled, transport-connected and inside the work window.
    pub fn is_alive(&self) -> bool {
        let account = self.account.read();
        account.enabled
            && self.connected.load(Ordering::SeqCst)
            && account.is_working_at(Local::now().time())
    }

    pub fn is_accept_new_task(&self) -> bool {
        self.is_alive() && self.accepting.load(Ordering::SeqCst)
    }

    /// True when `channel_id` is this instance's main, sub or private channel.
    pub fn matches_channel(&self, channel_id: &str) -> bool {
        let account = self.account.read();
        account.channel_id == channel_id
            || account.private_channel_id == channel_id
            || account.niji_private_channel_id == channel_id
            || account
                .sub_channels
                .iter()
                .any(|sub| sub.channel_id == channel_id)
    }

    // ------------------------------------------------------------------
    // Scheduling state
    // ------------------------------------------------------------------

    pub fn queued_total(&self) -> usize {
        self.queues
            .values()
            .map(|q| q.queued.load(Ordering::SeqCst))
            .sum()
    }

    pub fn queued_for(&self, mode: SpeedMode) -> usize {
        self.queue(mode).queued.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    pub fn running_task_ids(&self) -> Vec<String> {
        self.running.read().keys().cloned().collect()
    }

    pub fn task_by_nonce(&self, nonce: &str) -> Option<String> {
        self.by_nonce.read().get(nonce).cloned()
    }

    pub fn task_by_message(&self, message_id: &str) -> Option<String> {
        self.by_message_id.read().get(message_id).cloned()
    }

    /// Record the message id assigned by the upstream on first correlation.
    pub fn index_message(&self, message_id: &str, task_id: &str) {
        self.by_message_id
            .write()
            .insert(message_id.to_string(), task_id.to_string());
    }

    pub fn register_seed_wait(&self, hash: &str, task_id: &str) {
        self.seed_waits
            .write()
            .insert(hash.to_string(), task_id.to_string());
    }

    pub fn seed_waits(&self) -> Vec<(String, String)> {
        self.seed_waits
            .read()
            .iter()
            .map(|(hash, id)| (hash.clone(), id.clone()))
            .collect()
    }

    pub fn clear_seed_wait(&self, hash: &str) {
        self.seed_waits.write().remove(hash);
    }

    /// Resolve the requested mode against the account's allowed modes,
    /// downgrading TURBO -> FAST -> RELAX where needed.
    pub fn validate_mode(
        &self,
        preferred: Option<SpeedMode>,
        filter: &AccountFilter,
    ) -> Option<SpeedMode> {
        let account = self.account.read();
        let mut candidates = Vec::new();
        if let Some(mode) = preferred {
            candidates.push(mode);
        }
        candidates.extend(filter.modes.iter().copied());
        if let Some(mode) = account.mode {
            candidates.push(mode);
        }
        candidates.push(SpeedMode::Fast);

        for candidate in candidates {
            for mode in downgrade_chain(candidate) {
                if account.is_mode_allowed(*mode) {
                    return Some(*mode);
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Queue a task for execution. Precondition failures return without
    /// touching the task.
    pub async fn submit_task(&self, task: &mut Task, producer: Producer) -> SubmitResult {
        if !self.is_accept_new_task() {
            return SubmitResult::not_found("instance not available");
        }
        let Some(mode) = self.validate_mode(task.mode, &task.account_filter) else {
            return SubmitResult::failure("no allowed speed mode");
        };

        let (position, idle) = {
            let _gate = self.submit_gate.lock();
            let queue = self.queue(mode);
            let queued = queue.queued.load(Ordering::SeqCst);
            let capacity = self.account.read().queue_size_for(mode);
            if queued >= capacity {
                return SubmitResult::failure("queue full");
            }
            queue.queued.fetch_add(1, Ordering::SeqCst);
            let idle =
                queued == 0 && self.running_count() < self.account.read().core_size.max(1);
            (queued, idle)
        };

        task.status = TaskStatus::Submitted;
        // The timeout budget runs from this transition.
        task.submit_time = Utc::now();
        task.mode = Some(mode);
        task.instance_id = Some(self.channel_id());
        if let Err(e) = self.store.save(task).await {
            self.queue(mode).queued.fetch_sub(1, Ordering::SeqCst);
            return SubmitResult::failure(format!("storage error: {e}"));
        }
        if let Some(nonce) = &task.properties.nonce {
            self.by_nonce
                .write()
                .insert(nonce.clone(), task.id.clone());
        }

        let job = QueuedJob {
            task_id: task.id.clone(),
            producer,
        };
        if self.queue(mode).tx.try_send(job).is_err() {
            // Raced against a capacity change; undo the reservation.
            self.queue(mode).queued.fetch_sub(1, Ordering::SeqCst);
            if let Some(nonce) = &task.properties.nonce {
                self.by_nonce.write().remove(nonce);
            }
            task.status = TaskStatus::NotStart;
            task.instance_id = None;
            let _ = self.store.save(task).await;
            return SubmitResult::failure("queue full");
        }

        self.bus.publish(TaskNotice {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress.clone(),
        });

        if idle {
            SubmitResult::success(task.id.clone())
        } else {
            SubmitResult::in_queue(task.id.clone(), position)
        }
    }

    /// Best-effort cancel. Queued tasks are marked CANCEL and skipped by
    /// the worker; dispatched tasks get no upstream recall.
    pub async fn cancel_task(&self, task_id: &str) -> crate::Result<bool> {
        let _guard = self.locks.lock(task_id).await;
        let Some(mut task) = self.store.get(task_id).await? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.cancel();
        self.store.save(&task).await?;
        self.bus.publish(TaskNotice {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress.clone(),
        });
        Ok(true)
    }

    /// Stop the dispatchers and workers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    async fn run_job(self: Arc<Self>, mode: SpeedMode, job: QueuedJob) {
        let task_id = job.task_id;

        {
            let _guard = self.locks.lock(&task_id).await;
            let task = match self.store.get(&task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    warn!("worker failed to load task {task_id}: {e}");
                    return;
                }
            };
            // Cancelled while queued.
            if task.status.is_terminal() {
                self.cleanup_task(&task);
                return;
            }
            let mut task = task;
            task.start();
            if let Err(e) = self.store.save(&task).await {
                warn!("worker failed to persist start of {task_id}: {e}");
                return;
            }
            self.bus.publish(TaskNotice {
                task_id: task.id.clone(),
                status: task.status,
                progress: task.progress.clone(),
            });
        }

        self.running.write().insert(task_id.clone(), mode);
        self.running_count.fetch_add(1, Ordering::SeqCst);

        let outcome = self.paced_invoke(job.producer).await;
        match outcome {
            Ok(message) if message.is_accepted() => {
                debug!(
                    "task {task_id} accepted upstream (code {}), awaiting events",
                    message.code
                );
                self.await_terminal(&task_id).await;
            }
            Ok(message) => {
                self.mark_failure(&task_id, &message.description).await;
            }
            Err(e) => {
                self.mark_failure(&task_id, &e.to_string()).await;
            }
        }

        if let Ok(Some(task)) = self.store.get(&task_id).await {
            self.cleanup_task(&task);
        }
        self.running.write().remove(&task_id);
        self.running_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Serialize sends through the pacing clock: a fresh burst waits the
    /// account's leading interval, successive sends wait a uniform random
    /// span inside the configured bounds.
    async fn paced_invoke(&self, producer: Producer) -> crate::Result<Message> {
        let mut last_send = self.last_send.lock().await;
        let (interval, after_min, after_max) = {
            let account = self.account.read();
            (
                account.interval_ms,
                account.after_interval_min_ms,
                account.after_interval_max_ms,
            )
        };
        let wait = match *last_send {
            Some(at) if at.elapsed() < BURST_IDLE_GAP => {
                let (lo, hi) = (after_min.min(after_max), after_min.max(after_max));
                let span = rand::thread_rng().gen_range(lo..=hi);
                Duration::from_millis(span).saturating_sub(at.elapsed())
            }
            _ => Duration::from_millis(interval),
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let result = producer().await;
        *last_send = Some(Instant::now());
        result
    }

    /// Wait for the correlator to drive the task terminal. The timeout
    /// budget runs from SUBMITTED, so time already spent queued and in
    /// the pacing wait counts against it.
    async fn await_terminal(&self, task_id: &str) {
        let timeout_minutes = self.account.read().timeout_minutes.max(1);
        let budget = Duration::from_secs(timeout_minutes * 60);
        let spent = match self.store.get(task_id).await {
            Ok(Some(task)) => (Utc::now() - task.submit_time).to_std().unwrap_or_default(),
            Ok(None) => return,
            Err(e) => {
                warn!("worker failed to load task {task_id}: {e}");
                Duration::ZERO
            }
        };
        let deadline = Instant::now() + budget.saturating_sub(spent);
        let mut rx = self.bus.subscribe();

        loop {
            match self.store.get(task_id).await {
                Ok(Some(task)) if task.status.is_terminal() => return,
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    warn!("worker failed to poll task {task_id}: {e}");
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.mark_failure(task_id, "task timeout").await;
                return;
            }
            // Wake on any notice for this task; the 5s floor covers missed
            // or lagged broadcasts.
            let wait = remaining.min(Duration::from_secs(5));
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
                notice = rx.recv() => {
                    if let Ok(notice) = notice {
                        if notice.task_id != task_id {
                            continue;
                        }
                    }
                }
            }
        }
    }

    async fn mark_failure(&self, task_id: &str, reason: &str) {
        let _guard = self.locks.lock(task_id).await;
        let Ok(Some(mut task)) = self.store.get(task_id).await else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.fail(reason);
        if let Err(e) = self.store.save(&task).await {
            warn!("failed to persist failure of {task_id}: {e}");
            return;
        }
        self.bus.publish(TaskNotice {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress.clone(),
        });
    }

    fn cleanup_task(&self, task: &Task) {
        if let Some(nonce) = &task.properties.nonce {
            self.by_nonce.write().remove(nonce);
        }
        if let Some(message_id) = &task.properties.message_id {
            self.by_message_id.write().remove(message_id);
        }
    }
}

fn downgrade_chain(mode: SpeedMode) -> &'static [SpeedMode] {
    match mode {
        SpeedMode::Turbo => &[SpeedMode::Turbo, SpeedMode::Fast, SpeedMode::Relax],
        SpeedMode::Fast => &[SpeedMode::Fast, SpeedMode::Relax],
        SpeedMode::Relax => &[SpeedMode::Relax],
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests_support::StubGateway;
    use easel_store::MemoryTaskStore;
    use easel_types::{BackendFamily, BotFamily, TaskAction};

    fn make_instance(account: Account) -> (Arc<UpstreamInstance>, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        let instance = UpstreamInstance::start(
            account,
            Arc::new(StubGateway::default()),
            store.clone(),
            Arc::new(KeyLockManager::new()),
            NotificationBus::new(),
        );
        (instance, store)
    }

    fn quick_account(channel: &str) -> Account {
        let mut account = Account::new(channel, "guild");
        account.interval_ms = 0;
        account.after_interval_min_ms = 0;
        account.after_interval_max_ms = 0;
        account
    }

    fn make_task() -> Task {
        Task::new(TaskAction::Imagine, BotFamily::Mj, BackendFamily::Chat)
    }

    #[tokio::test]
    async fn mode_downgrades_to_allowed() {
        let mut account = quick_account("c1");
        account.allowed_modes = vec![SpeedMode::Relax];
        let (instance, _) = make_instance(account);
        let mode = instance.validate_mode(Some(SpeedMode::Turbo), &AccountFilter::default());
        assert_eq!(mode, Some(SpeedMode::Relax));
        instance.shutdown();
    }

    #[tokio::test]
    async fn queue_full_rejects_without_touching_task() {
        let mut account = quick_account("c1");
        account.core_size = 1;
        account.queue_size = 1;
        // Slow producer keeps the single worker busy.
        let store = Arc::new(MemoryTaskStore::new());
        let instance = UpstreamInstance::start(
            account,
            Arc::new(StubGateway::default()),
            store.clone(),
            Arc::new(KeyLockManager::new()),
            NotificationBus::new(),
        );

        let slow = || -> Producer {
            Box::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Message::success())
                })
            })
        };

        let mut t1 = make_task();
        let r1 = instance.submit_task(&mut t1, slow()).await;
        assert!(r1.is_success());

        // Give the dispatcher time to hand t1 to the worker.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut t2 = make_task();
        let r2 = instance.submit_task(&mut t2, slow()).await;
        assert_eq!(r2.code, easel_types::SubmitCode::InQueue);

        let mut t3 = make_task();
        let r3 = instance.submit_task(&mut t3, slow()).await;
        assert_eq!(r3.code, easel_types::SubmitCode::Failure);
        assert_eq!(r3.description, "queue full");
        assert_eq!(t3.status, TaskStatus::NotStart);

        instance.shutdown();
    }

    #[tokio::test]
    async fn producer_error_marks_failure() {
        let (instance, store) = make_instance(quick_account("c1"));
        let mut task = make_task();
        let producer: Producer = Box::new(|| {
            Box::pin(async { Ok(Message::of(0, "Invalid parameter")) })
        });
        let result = instance.submit_task(&mut task, producer).await;
        assert!(result.is_success());

        // Worker picks it up and records the upstream rejection.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(task) = store.get(&task.id).await.unwrap() {
                if task.status.is_terminal() {
                    assert_eq!(task.status, TaskStatus::Failure);
                    assert_eq!(task.fail_reason.as_deref(), Some("Invalid parameter"));
                    instance.shutdown();
                    return;
                }
            }
        }
        panic!("task never reached a terminal status");
    }

    #[tokio::test]
    async fn cancel_while_queued_is_skipped_by_worker() {
        let mut account = quick_account("c1");
        account.core_size = 1;
        let (instance, store) = make_instance(account);

        // Holds the single worker long enough to cancel t2, then frees it.
        let blocker: Producer = Box::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Message::of(0, "done"))
            })
        });
        let mut t1 = make_task();
        instance.submit_task(&mut t1, blocker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut t2 = make_task();
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let producer: Producer = Box::new(move || {
            called2.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(Message::success()) })
        });
        instance.submit_task(&mut t2, producer).await;

        assert!(instance.cancel_task(&t2.id).await.unwrap());
        let task = store.get(&t2.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancel);

        // The freed worker dequeues t2, sees CANCEL and never sends.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!called.load(Ordering::SeqCst));
        let task = store.get(&t2.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancel);
        instance.shutdown();
    }
}
