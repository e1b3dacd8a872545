use tokio::sync::broadcast;

use easel_types::TaskStatus;

/// A task state change, published after every persisted mutation.
#[derive(Debug, Clone)]
pub struct TaskNotice {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: String,
}

#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<TaskNotice>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: TaskNotice) {
        let _ = self.tx.send(notice);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
