use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use steward_core::domain::tool::{ToolServerConfig, ToolServerSource};
use steward_core::errors::ApplicationError;

use super::RepositoryError;
use crate::DbPool;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ToolServerId(pub String);

#[derive(Clone, Debug, PartialEq)]
pub struct ToolServerRecord {
    pub id: ToolServerId,
    pub config: ToolServerConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update; `None` fields keep their stored value.
#[derive(Clone, Debug, Default)]
pub struct ToolServerPatch {
    pub name: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub is_enabled: Option<bool>,
}

pub struct SqlToolServerRepository {
    pool: DbPool,
}

impl SqlToolServerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<ToolServerRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, command, args_json, env_json, is_enabled, created_at, updated_at
             FROM tool_servers
             ORDER BY created_at ASC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn find_by_id(
        &self,
        id: &ToolServerId,
    ) -> Result<Option<ToolServerRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, command, args_json, env_json, is_enabled, created_at, updated_at
             FROM tool_servers
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    pub async fn add(&self, config: ToolServerConfig) -> Result<ToolServerRecord, RepositoryError> {
        validate(&config)?;
        let now = Utc::now();
        let record = ToolServerRecord {
            id: ToolServerId(Uuid::new_v4().to_string()),
            config,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO tool_servers (
                id,
                name,
                command,
                args_json,
                env_json,
                is_enabled,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(&record.config.name)
        .bind(&record.config.command)
        .bind(encode(&record.config.args)?)
        .bind(encode(&record.config.env)?)
        .bind(record.config.is_enabled)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn update(
        &self,
        id: &ToolServerId,
        patch: ToolServerPatch,
    ) -> Result<Option<ToolServerRecord>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, name, command, args_json, env_json, is_enabled, created_at, updated_at
             FROM tool_servers
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut record) = row.map(record_from_row).transpose()? else {
            return Ok(None);
        };

        if let Some(name) = patch.name {
            record.config.name = name;
        }
        if let Some(command) = patch.command {
            record.config.command = command;
        }
        if let Some(args) = patch.args {
            record.config.args = args;
        }
        if let Some(env) = patch.env {
            record.config.env = env;
        }
        if let Some(is_enabled) = patch.is_enabled {
            record.config.is_enabled = is_enabled;
        }
        validate(&record.config)?;
        record.updated_at = Utc::now();

        sqlx::query(
            "UPDATE tool_servers SET
                name = ?,
                command = ?,
                args_json = ?,
                env_json = ?,
                is_enabled = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(&record.config.name)
        .bind(&record.config.command)
        .bind(encode(&record.config.args)?)
        .bind(encode(&record.config.env)?)
        .bind(record.config.is_enabled)
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    pub async fn delete(&self, id: &ToolServerId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM tool_servers WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ToolServerSource for SqlToolServerRepository {
    async fn list_enabled(&self) -> Result<Vec<ToolServerConfig>, ApplicationError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.config.is_enabled)
            .map(|record| record.config)
            .collect())
    }
}

fn validate(config: &ToolServerConfig) -> Result<(), RepositoryError> {
    if config.name.trim().is_empty() {
        return Err(RepositoryError::Invariant("tool server name must not be empty".into()));
    }
    if config.command.trim().is_empty() {
        return Err(RepositoryError::Invariant(format!(
            "tool server `{}` must have a command",
            config.name
        )));
    }
    Ok(())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode tool server: {error}")))
}

fn record_from_row(row: SqliteRow) -> Result<ToolServerRecord, RepositoryError> {
    let name: String = row.try_get("name")?;
    let args_raw: String = row.try_get("args_json")?;
    let env_raw: String = row.try_get("env_json")?;

    let args = serde_json::from_str(&args_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid args_json for tool server `{name}`: {error}"))
    })?;
    let env = serde_json::from_str(&env_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid env_json for tool server `{name}`: {error}"))
    })?;

    Ok(ToolServerRecord {
        id: ToolServerId(row.try_get("id")?),
        config: ToolServerConfig {
            name,
            command: row.try_get("command")?,
            args,
            env,
            is_enabled: row.try_get("is_enabled")?,
        },
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
