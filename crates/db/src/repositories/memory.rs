use std::collections::HashMap;

use tokio::sync::RwLock;

use steward_core::domain::checkpoint::{
    ChannelWrite, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef, CheckpointTuple,
    PendingWrite, ThreadId,
};

use super::{CheckpointStore, RepositoryError, ThreadSummary};

#[derive(Clone)]
struct StoredCheckpoint {
    seq: u64,
    parent: Option<CheckpointId>,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
}

#[derive(Default)]
struct ThreadLog {
    // Creation order; re-puts update in place.
    checkpoints: Vec<StoredCheckpoint>,
    writes: Vec<(CheckpointId, PendingWrite)>,
}

impl ThreadLog {
    fn find(&self, id: &CheckpointId) -> Option<&StoredCheckpoint> {
        self.checkpoints.iter().find(|stored| &stored.checkpoint.id == id)
    }

    fn tuple(
        &self,
        thread_id: &ThreadId,
        stored: &StoredCheckpoint,
        with_writes: bool,
    ) -> CheckpointTuple {
        let pending_writes = if with_writes {
            self.writes
                .iter()
                .filter(|(id, _)| id == &stored.checkpoint.id)
                .map(|(_, write)| write.clone())
                .collect()
        } else {
            Vec::new()
        };

        CheckpointTuple {
            config: CheckpointRef {
                thread_id: thread_id.clone(),
                checkpoint_id: stored.checkpoint.id.clone(),
            },
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent: stored.parent.clone().map(|checkpoint_id| CheckpointRef {
                thread_id: thread_id.clone(),
                checkpoint_id,
            }),
            pending_writes,
        }
    }
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    threads: HashMap<ThreadId, ThreadLog>,
}

/// Process-local checkpoint store with the same semantics as the SQLite one.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<Inner>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_tuple(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: Option<&CheckpointId>,
    ) -> Result<Option<CheckpointTuple>, RepositoryError> {
        let inner = self.inner.read().await;
        let Some(log) = inner.threads.get(thread_id) else {
            return Ok(None);
        };

        let stored = match checkpoint_id {
            Some(id) => log.find(id),
            None => log.checkpoints.last(),
        };
        Ok(stored.map(|stored| log.tuple(thread_id, stored, true)))
    }

    async fn list(
        &self,
        thread_id: &ThreadId,
        before: Option<&CheckpointId>,
        limit: Option<u32>,
    ) -> Result<Vec<CheckpointTuple>, RepositoryError> {
        let inner = self.inner.read().await;
        let Some(log) = inner.threads.get(thread_id) else {
            return Ok(Vec::new());
        };

        let bound = match before {
            Some(id) => match log.find(id) {
                Some(stored) => stored.seq,
                None => return Ok(Vec::new()),
            },
            None => u64::MAX,
        };
        let limit = limit.map(|value| value as usize).unwrap_or(usize::MAX);

        Ok(log
            .checkpoints
            .iter()
            .rev()
            .filter(|stored| stored.seq < bound)
            .take(limit)
            .map(|stored| log.tuple(thread_id, stored, false))
            .collect())
    }

    async fn put(
        &self,
        thread_id: &ThreadId,
        parent: Option<&CheckpointId>,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointRef, RepositoryError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        if let Some(parent) = parent {
            if parent == &checkpoint.id {
                return Err(RepositoryError::Invariant(format!(
                    "checkpoint `{}` cannot be its own parent",
                    checkpoint.id
                )));
            }
            let exists =
                inner.threads.get(thread_id).and_then(|log| log.find(parent)).is_some();
            if !exists {
                return Err(RepositoryError::Invariant(format!(
                    "parent checkpoint `{parent}` does not exist in thread `{thread_id}`"
                )));
            }
        } else if let Some(log) = inner.threads.get(thread_id) {
            if !log.checkpoints.is_empty() && log.find(&checkpoint.id).is_none() {
                return Err(RepositoryError::Invariant(format!(
                    "checkpoint `{}` needs a parent: thread `{thread_id}` already has checkpoints",
                    checkpoint.id
                )));
            }
        }

        let seq = inner.next_seq;
        let log = inner.threads.entry(thread_id.clone()).or_default();
        match log.checkpoints.iter_mut().find(|stored| stored.checkpoint.id == checkpoint.id) {
            Some(existing) => {
                existing.checkpoint = checkpoint.clone();
                existing.metadata = metadata.clone();
            }
            None => {
                log.checkpoints.push(StoredCheckpoint {
                    seq,
                    parent: parent.cloned(),
                    checkpoint: checkpoint.clone(),
                    metadata: metadata.clone(),
                });
                inner.next_seq += 1;
            }
        }

        Ok(CheckpointRef { thread_id: thread_id.clone(), checkpoint_id: checkpoint.id.clone() })
    }

    async fn put_writes(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        writes: &[ChannelWrite],
        task_id: &str,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let log = inner
            .threads
            .get_mut(thread_id)
            .filter(|log| log.find(checkpoint_id).is_some())
            .ok_or_else(|| {
                RepositoryError::Invariant(format!(
                    "cannot record writes for unknown checkpoint `{checkpoint_id}` in thread `{thread_id}`"
                ))
            })?;

        for (idx, write) in writes.iter().enumerate() {
            let idx = u32::try_from(idx)
                .map_err(|_| RepositoryError::Invariant("too many writes in one call".into()))?;
            let record = PendingWrite {
                task_id: task_id.to_string(),
                idx,
                channel: write.channel.clone(),
                value: write.value.clone(),
            };
            let existing = log.writes.iter_mut().find(|(id, pending)| {
                id == checkpoint_id && pending.task_id == task_id && pending.idx == idx
            });
            match existing {
                Some((_, pending)) => *pending = record,
                None => log.writes.push((checkpoint_id.clone(), record)),
            }
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), RepositoryError> {
        self.inner.write().await.threads.remove(thread_id);
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<(u64, ThreadSummary)> = inner
            .threads
            .iter()
            .filter_map(|(thread_id, log)| {
                let last = log.checkpoints.iter().max_by_key(|stored| stored.seq)?;
                let last_updated_at =
                    log.checkpoints.iter().map(|stored| stored.checkpoint.created_at).max()?;
                Some((
                    last.seq,
                    ThreadSummary {
                        thread_id: thread_id.clone(),
                        checkpoint_count: u32::try_from(log.checkpoints.len()).unwrap_or(u32::MAX),
                        last_updated_at,
                    },
                ))
            })
            .collect();
        summaries.sort_by(|left, right| right.0.cmp(&left.0));
        Ok(summaries.into_iter().map(|(_, summary)| summary).collect())
    }
}
