use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use steward_core::domain::checkpoint::{
    ChannelWrite, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef, CheckpointTuple,
    ThreadId,
};
use steward_core::errors::ApplicationError;

pub mod checkpoint;
pub mod memory;
pub mod settings;
pub mod tool_server;

pub use checkpoint::SqlCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use settings::{SqlSettingsRepository, SystemSetting};
pub use tool_server::{SqlToolServerRepository, ToolServerId, ToolServerPatch, ToolServerRecord};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub checkpoint_count: u32,
    pub last_updated_at: DateTime<Utc>,
}

/// Durable store of per-thread checkpoint chains and their pending writes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Exact checkpoint when `checkpoint_id` is given, otherwise the most recently created one.
    async fn get_tuple(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: Option<&CheckpointId>,
    ) -> Result<Option<CheckpointTuple>, RepositoryError>;

    /// Newest first. `before` is an exclusive cursor; tuples carry no pending writes.
    async fn list(
        &self,
        thread_id: &ThreadId,
        before: Option<&CheckpointId>,
        limit: Option<u32>,
    ) -> Result<Vec<CheckpointTuple>, RepositoryError>;

    /// Upserts `checkpoint` under `checkpoint.id`. Re-putting an existing id replaces its
    /// state and metadata but keeps the stored parent. A new checkpoint without a parent is
    /// only accepted as the first checkpoint of its thread.
    async fn put(
        &self,
        thread_id: &ThreadId,
        parent: Option<&CheckpointId>,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointRef, RepositoryError>;

    async fn put_writes(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        writes: &[ChannelWrite],
        task_id: &str,
    ) -> Result<(), RepositoryError>;

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), RepositoryError>;

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, RepositoryError>;
}

/// Pages through a thread's checkpoints newest first, one `list` call per page.
pub struct CheckpointHistory<'a> {
    store: &'a dyn CheckpointStore,
    thread_id: ThreadId,
    page_size: u32,
    cursor: Option<CheckpointId>,
    exhausted: bool,
}

impl<'a> CheckpointHistory<'a> {
    pub fn new(store: &'a dyn CheckpointStore, thread_id: ThreadId, page_size: u32) -> Self {
        Self { store, thread_id, page_size: page_size.max(1), cursor: None, exhausted: false }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<CheckpointTuple>>, RepositoryError> {
        if self.exhausted {
            return Ok(None);
        }

        let page =
            self.store.list(&self.thread_id, self.cursor.as_ref(), Some(self.page_size)).await?;
        if page.len() < self.page_size as usize {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => self.cursor = Some(last.checkpoint.id.clone()),
            None => return Ok(None),
        }
        Ok(Some(page))
    }

    pub async fn collect_all(mut self) -> Result<Vec<CheckpointTuple>, RepositoryError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
