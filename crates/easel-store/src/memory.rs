// In-memory repositories.
// Reads clone the stored value so callers never observe partial updates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use easel_types::{BannedWordSet, DomainTag, Task};

use crate::{
    BannedWordStore, DomainStore, StoreResult, TaskOrder, TaskQuery, TaskStore,
};

#[derive(Default, Clone)]
pub struct MemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        Ok(self.tasks.read().get(id).cloned())
    }

    async fn save(&self, task: &Task) -> StoreResult<()> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.tasks.write().remove(id);
        Ok(())
    }

    async fn list(
        &self,
        query: &TaskQuery,
        order: TaskOrder,
        asc: bool,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        match order {
            TaskOrder::SubmitTime => tasks.sort_by_key(|t| t.submit_time),
            TaskOrder::Id => tasks.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        if !asc {
            tasks.reverse();
        }
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn count(&self, query: &TaskQuery) -> StoreResult<usize> {
        Ok(self.tasks.read().values().filter(|t| query.matches(t)).count())
    }
}

#[derive(Default, Clone)]
pub struct MemoryDomainStore {
    tags: Arc<RwLock<Vec<DomainTag>>>,
}

impl MemoryDomainStore {
    pub fn new(tags: Vec<DomainTag>) -> Self {
        Self {
            tags: Arc::new(RwLock::new(tags)),
        }
    }

    pub fn replace(&self, tags: Vec<DomainTag>) {
        *self.tags.write() = tags;
    }
}

#[async_trait]
impl DomainStore for MemoryDomainStore {
    async fn list_enabled(&self) -> StoreResult<Vec<DomainTag>> {
        Ok(self.tags.read().iter().filter(|t| t.enabled).cloned().collect())
    }
}

#[derive(Default, Clone)]
pub struct MemoryBannedWordStore {
    sets: Arc<RwLock<Vec<BannedWordSet>>>,
}

impl MemoryBannedWordStore {
    pub fn new(sets: Vec<BannedWordSet>) -> Self {
        Self {
            sets: Arc::new(RwLock::new(sets)),
        }
    }

    pub fn replace(&self, sets: Vec<BannedWordSet>) {
        *self.sets.write() = sets;
    }
}

#[async_trait]
impl BannedWordStore for MemoryBannedWordStore {
    async fn list_enabled(&self) -> StoreResult<Vec<BannedWordSet>> {
        Ok(self.sets.read().iter().filter(|s| s.enabled).cloned().collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use easel_types::{BackendFamily, BotFamily, TaskAction, TaskStatus};

    fn make_task(action: TaskAction, status: TaskStatus, instance: &str) -> Task {
        let mut task = Task::new(action, BotFamily::Mj, BackendFamily::Chat);
        task.status = status;
        task.instance_id = Some(instance.to_string());
        task
    }

    #[tokio::test]
    async fn save_is_upsert() {
        let store = MemoryTaskStore::new();
        let mut task = make_task(TaskAction::Imagine, TaskStatus::NotStart, "c1");
        store.save(&task).await.unwrap();

        task.status = TaskStatus::Submitted;
        store.save(&task).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Submitted);
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let store = MemoryTaskStore::new();
        let running = make_task(TaskAction::Imagine, TaskStatus::InProgress, "c1");
        let queued = make_task(TaskAction::Imagine, TaskStatus::Submitted, "c1");
        let other = make_task(TaskAction::Blend, TaskStatus::InProgress, "c2");
        for t in [&running, &queued, &other] {
            store.save(t).await.unwrap();
        }

        let query = TaskQuery::by_status(vec![TaskStatus::InProgress, TaskStatus::Submitted])
            .on_instance("c1");
        let found = store.list(&query, TaskOrder::Id, true, None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.windows(2).all(|w| w[0].id <= w[1].id));

        assert_eq!(store.count(&query).await.unwrap(), 2);
        assert!(store.exists(&query).await.unwrap());
    }

    #[tokio::test]
    async fn query_by_nonce_and_message_id() {
        let store = MemoryTaskStore::new();
        let mut task = make_task(TaskAction::Imagine, TaskStatus::InProgress, "c1");
        task.properties.nonce = Some("n-1".to_string());
        task.properties.message_id = Some("m-1".to_string());
        store.save(&task).await.unwrap();

        let by_nonce = TaskQuery {
            nonce: Some("n-1".to_string()),
            ..TaskQuery::default()
        };
        assert_eq!(store.count(&by_nonce).await.unwrap(), 1);

        let by_message = TaskQuery {
            message_id: Some("m-2".to_string()),
            ..TaskQuery::default()
        };
        assert_eq!(store.count(&by_message).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_dictionaries_are_hidden() {
        let mut tag = DomainTag::new("anime", vec!["waifu".to_string()]);
        tag.enabled = false;
        let store = MemoryDomainStore::new(vec![tag]);
        assert!(store.list_enabled().await.unwrap().is_empty());
    }
}
