use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use steward_core::domain::checkpoint::{
    ChannelWrite, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef, CheckpointTuple,
    PendingWrite, ThreadId,
};

use super::{CheckpointStore, RepositoryError, ThreadSummary};
use crate::DbPool;

pub struct SqlCheckpointStore {
    pool: DbPool,
}

impl SqlCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_writes(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<PendingWrite>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT task_id, idx, channel, value_json
             FROM checkpoint_writes
             WHERE thread_id = ? AND checkpoint_id = ?
             ORDER BY rowid ASC",
        )
        .bind(&thread_id.0)
        .bind(&checkpoint_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(write_from_row).collect()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn get_tuple(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: Option<&CheckpointId>,
    ) -> Result<Option<CheckpointTuple>, RepositoryError> {
        let row = match checkpoint_id {
            Some(checkpoint_id) => {
                sqlx::query(
                    "SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint_json, metadata_json
                     FROM checkpoints
                     WHERE thread_id = ? AND checkpoint_id = ?",
                )
                .bind(&thread_id.0)
                .bind(&checkpoint_id.0)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint_json, metadata_json
                     FROM checkpoints
                     WHERE thread_id = ?
                     ORDER BY seq DESC
                     LIMIT 1",
                )
                .bind(&thread_id.0)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };
        let mut tuple = tuple_from_row(row)?;
        tuple.pending_writes = self.load_writes(thread_id, &tuple.checkpoint.id).await?;
        Ok(Some(tuple))
    }

    async fn list(
        &self,
        thread_id: &ThreadId,
        before: Option<&CheckpointId>,
        limit: Option<u32>,
    ) -> Result<Vec<CheckpointTuple>, RepositoryError> {
        let before = before.map(|id| id.0.as_str());
        let limit = limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            "SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint_json, metadata_json
             FROM checkpoints
             WHERE thread_id = ?
               AND (? IS NULL OR seq < (
                    SELECT cursor.seq FROM checkpoints AS cursor
                    WHERE cursor.thread_id = ? AND cursor.checkpoint_id = ?
               ))
             ORDER BY seq DESC
             LIMIT ?",
        )
        .bind(&thread_id.0)
        .bind(before)
        .bind(&thread_id.0)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(tuple_from_row).collect()
    }

    async fn put(
        &self,
        thread_id: &ThreadId,
        parent: Option<&CheckpointId>,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointRef, RepositoryError> {
        let checkpoint_json = encode("checkpoint", checkpoint)?;
        let metadata_json = encode("metadata", metadata)?;

        let mut tx = self.pool.begin().await?;

        if let Some(parent) = parent {
            if parent == &checkpoint.id {
                return Err(RepositoryError::Invariant(format!(
                    "checkpoint `{}` cannot be its own parent",
                    checkpoint.id
                )));
            }
            let exists = sqlx::query(
                "SELECT 1 AS found FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?",
            )
            .bind(&thread_id.0)
            .bind(&parent.0)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
            if !exists {
                return Err(RepositoryError::Invariant(format!(
                    "parent checkpoint `{parent}` does not exist in thread `{thread_id}`"
                )));
            }
        } else {
            // Only the first checkpoint of a thread may be a root; re-puts of it stay allowed.
            let other_root = sqlx::query(
                "SELECT 1 AS found FROM checkpoints
                 WHERE thread_id = ?
                   AND NOT EXISTS (
                       SELECT 1 FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?
                   )
                 LIMIT 1",
            )
            .bind(&thread_id.0)
            .bind(&thread_id.0)
            .bind(&checkpoint.id.0)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
            if other_root {
                return Err(RepositoryError::Invariant(format!(
                    "checkpoint `{}` needs a parent: thread `{thread_id}` already has checkpoints",
                    checkpoint.id
                )));
            }
        }

        sqlx::query(
            "INSERT INTO checkpoints (
                thread_id,
                checkpoint_id,
                parent_checkpoint_id,
                checkpoint_json,
                metadata_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id, checkpoint_id) DO UPDATE SET
                checkpoint_json = excluded.checkpoint_json,
                metadata_json = excluded.metadata_json",
        )
        .bind(&thread_id.0)
        .bind(&checkpoint.id.0)
        .bind(parent.map(|id| id.0.as_str()))
        .bind(checkpoint_json)
        .bind(metadata_json)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            event_name = "checkpoint.put",
            thread_id = %thread_id,
            checkpoint_id = %checkpoint.id,
            step = metadata.step,
            "checkpoint stored"
        );

        Ok(CheckpointRef { thread_id: thread_id.clone(), checkpoint_id: checkpoint.id.clone() })
    }

    async fn put_writes(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        writes: &[ChannelWrite],
        task_id: &str,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query(
            "SELECT 1 AS found FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?",
        )
        .bind(&thread_id.0)
        .bind(&checkpoint_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
        if !exists {
            return Err(RepositoryError::Invariant(format!(
                "cannot record writes for unknown checkpoint `{checkpoint_id}` in thread `{thread_id}`"
            )));
        }

        let now = Utc::now().to_rfc3339();
        for (idx, write) in writes.iter().enumerate() {
            let idx = i64::try_from(idx)
                .map_err(|_| RepositoryError::Invariant("too many writes in one call".into()))?;
            sqlx::query(
                "INSERT INTO checkpoint_writes (
                    thread_id,
                    checkpoint_id,
                    task_id,
                    idx,
                    channel,
                    value_json,
                    created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(thread_id, checkpoint_id, task_id, idx) DO UPDATE SET
                    channel = excluded.channel,
                    value_json = excluded.value_json",
            )
            .bind(&thread_id.0)
            .bind(&checkpoint_id.0)
            .bind(task_id)
            .bind(idx)
            .bind(&write.channel)
            .bind(encode("write value", &write.value)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?")
            .bind(&thread_id.0)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(&thread_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        debug!(
            event_name = "checkpoint.thread_deleted",
            thread_id = %thread_id,
            removed,
            "thread checkpoints deleted"
        );
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT thread_id, COUNT(*) AS checkpoint_count, MAX(created_at) AS last_updated_at
             FROM checkpoints
             GROUP BY thread_id
             ORDER BY MAX(seq) DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let count = row.try_get::<i64, _>("checkpoint_count")?;
                Ok(ThreadSummary {
                    thread_id: ThreadId(row.try_get("thread_id")?),
                    checkpoint_count: u32::try_from(count).map_err(|_| {
                        RepositoryError::Decode(format!("invalid checkpoint count {count}"))
                    })?,
                    last_updated_at: parse_timestamp(
                        "last_updated_at",
                        row.try_get("last_updated_at")?,
                    )?,
                })
            })
            .collect()
    }
}

fn tuple_from_row(row: SqliteRow) -> Result<CheckpointTuple, RepositoryError> {
    let thread_id = ThreadId(row.try_get("thread_id")?);
    let checkpoint_id = CheckpointId(row.try_get("checkpoint_id")?);
    let checkpoint: Checkpoint = decode("checkpoint_json", row.try_get("checkpoint_json")?)?;
    let metadata: CheckpointMetadata = decode("metadata_json", row.try_get("metadata_json")?)?;

    if checkpoint.id != checkpoint_id {
        return Err(RepositoryError::Decode(format!(
            "checkpoint row `{checkpoint_id}` holds payload for `{}`",
            checkpoint.id
        )));
    }

    let parent = row
        .try_get::<Option<String>, _>("parent_checkpoint_id")?
        .map(|parent| CheckpointRef { thread_id: thread_id.clone(), checkpoint_id: CheckpointId(parent) });

    Ok(CheckpointTuple {
        config: CheckpointRef { thread_id, checkpoint_id },
        checkpoint,
        metadata,
        parent,
        pending_writes: Vec::new(),
    })
}

fn write_from_row(row: SqliteRow) -> Result<PendingWrite, RepositoryError> {
    let idx = row.try_get::<i64, _>("idx")?;
    Ok(PendingWrite {
        task_id: row.try_get("task_id")?,
        idx: u32::try_from(idx)
            .map_err(|_| RepositoryError::Decode(format!("invalid write index {idx}")))?,
        channel: row.try_get("channel")?,
        value: decode("value_json", row.try_get("value_json")?)?,
    })
}

fn encode<T: serde::Serialize>(what: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode {what}: {error}")))
}

fn decode<T: serde::de::DeserializeOwned>(column: &str, raw: String) -> Result<T, RepositoryError> {
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

#[cfg(test)]
mod tests {
    use steward_core::{CheckpointId, LoopNode};

    use super::SqlCheckpointStore;
    use crate::migrations;
    use crate::repositories::{contract, CheckpointStore};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn put_is_idempotent_and_keeps_parent() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::put_is_idempotent_and_keeps_parent(&store).await;
    }

    #[tokio::test]
    async fn parent_must_exist_and_differ() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::parent_must_exist_and_differ(&store).await;
    }

    #[tokio::test]
    async fn thread_keeps_a_single_root() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::thread_keeps_a_single_root(&store).await;
    }

    #[tokio::test]
    async fn latest_follows_creation_order() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::latest_follows_creation_order(&store).await;
    }

    #[tokio::test]
    async fn list_pages_with_cursor() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::list_pages_with_cursor(&store).await;
    }

    #[tokio::test]
    async fn writes_upsert_and_attach_to_tuple() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::writes_upsert_and_attach_to_tuple(&store).await;
    }

    #[tokio::test]
    async fn delete_thread_removes_everything() {
        let store = SqlCheckpointStore::new(setup_pool().await);
        contract::delete_thread_removes_everything(&store).await;
    }

    #[tokio::test]
    async fn failed_put_leaves_no_partial_row() {
        let pool = setup_pool().await;
        let store = SqlCheckpointStore::new(pool.clone());
        let thread_id = contract::thread("thread-atomic");
        let orphan = contract::checkpoint("orphan", LoopNode::Agent);
        let missing = CheckpointId("missing".into());

        let _ = store.put(&thread_id, Some(&missing), &orphan, &contract::metadata(0)).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 0);
    }
}
