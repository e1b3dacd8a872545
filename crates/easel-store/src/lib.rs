//! Repository interfaces for the Easel core.
//!
//! The core persists tasks and reads dictionaries through these traits
//! only; concrete adapters (embedded file DB, document DB) live outside
//! the core. The in-memory implementation here backs tests and the demo
//! engine.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use easel_types::{BannedWordSet, DomainTag, Task, TaskAction, TaskStatus};

pub use memory::{MemoryBannedWordStore, MemoryDomainStore, MemoryTaskStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Query surface
// ============================================================================

/// Predicate filter for task queries. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub statuses: Vec<TaskStatus>,
    #[serde(default)]
    pub actions: Vec<TaskAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl TaskQuery {
    pub fn by_status(statuses: impl Into<Vec<TaskStatus>>) -> Self {
        Self {
            statuses: statuses.into(),
            ..Self::default()
        }
    }

    pub fn on_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if !self.actions.is_empty() && !self.actions.contains(&task.action) {
            return false;
        }
        if let Some(instance_id) = &self.instance_id {
            if task.instance_id.as_deref() != Some(instance_id.as_str()) {
                return false;
            }
        }
        if !self.ids.is_empty() && !self.ids.contains(&task.id) {
            return false;
        }
        if let Some(nonce) = &self.nonce {
            if task.properties.nonce.as_deref() != Some(nonce.as_str()) {
                return false;
            }
        }
        if let Some(message_id) = &self.message_id {
            if task.properties.message_id.as_deref() != Some(message_id.as_str()) {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if task.parent_id.as_deref() != Some(parent_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Sort order for `TaskStore::list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrder {
    SubmitTime,
    Id,
}

// ============================================================================
// Traits
// ============================================================================

/// Durable task persistence. `save` is a last-writer-wins upsert; callers
/// serialize interleaved updates with the task-level lock.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<Task>>;

    async fn save(&self, task: &Task) -> StoreResult<()>;

    async fn delete(&self, id: &str) -> StoreResult<()>;

    async fn list(
        &self,
        query: &TaskQuery,
        order: TaskOrder,
        asc: bool,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Task>>;

    async fn count(&self, query: &TaskQuery) -> StoreResult<usize>;

    async fn exists(&self, query: &TaskQuery) -> StoreResult<bool> {
        Ok(self.count(query).await? > 0)
    }
}

/// Read side of the domain dictionary.
#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn list_enabled(&self) -> StoreResult<Vec<DomainTag>>;
}

/// Read side of the banned-word dictionary.
#[async_trait]
pub trait BannedWordStore: Send + Sync {
    async fn list_enabled(&self) -> StoreResult<Vec<BannedWordSet>>;
}
