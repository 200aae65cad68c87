use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use steward_core::errors::ApplicationError;
use steward_core::settings::{SettingsProvider, LLM_API_KEY};

use super::RepositoryError;
use crate::DbPool;

#[derive(Clone, Debug, PartialEq)]
pub struct SystemSetting {
    pub key: String,
    pub value: Value,
    pub description: Option<String>,
    /// Marks values that must never be echoed back to operators.
    pub is_encrypted: bool,
    pub updated_at: DateTime<Utc>,
}

impl SystemSetting {
    /// Value safe to display: sensitive values are masked.
    pub fn display_value(&self) -> Value {
        if self.is_encrypted {
            Value::String("********".to_string())
        } else {
            self.value.clone()
        }
    }
}

/// Settings stored in the `system_settings` table, editable at runtime.
pub struct SqlSettingsRepository {
    pool: DbPool,
}

impl SqlSettingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, key: &str) -> Result<Option<SystemSetting>, RepositoryError> {
        let row = sqlx::query(
            "SELECT key, value_json, description, is_encrypted, updated_at
             FROM system_settings
             WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(setting_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<SystemSetting>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT key, value_json, description, is_encrypted, updated_at
             FROM system_settings
             ORDER BY key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(setting_from_row).collect()
    }

    /// Upserts a setting. An absent description keeps the stored one.
    pub async fn save(
        &self,
        key: &str,
        value: &Value,
        description: Option<&str>,
        is_encrypted: bool,
    ) -> Result<(), RepositoryError> {
        let value_json = serde_json::to_string(value)
            .map_err(|error| RepositoryError::Decode(format!("could not encode setting: {error}")))?;

        sqlx::query(
            "INSERT INTO system_settings (key, value_json, description, is_encrypted, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value_json = excluded.value_json,
                description = COALESCE(excluded.description, system_settings.description),
                is_encrypted = excluded.is_encrypted,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value_json)
        .bind(description)
        .bind(is_encrypted)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM system_settings WHERE key = ?").bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl SettingsProvider for SqlSettingsRepository {
    async fn get(&self, key: &str) -> Result<Option<Value>, ApplicationError> {
        Ok(self.find(key).await?.map(|setting| setting.value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ApplicationError> {
        self.save(key, &value, None, key == LLM_API_KEY).await?;
        Ok(())
    }
}

fn setting_from_row(row: SqliteRow) -> Result<SystemSetting, RepositoryError> {
    let key: String = row.try_get("key")?;
    let raw: String = row.try_get("value_json")?;
    let value = serde_json::from_str(&raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid json for setting `{key}`: {error}"))
    })?;
    let updated_at: String = row.try_get("updated_at")?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| {
            RepositoryError::Decode(format!(
                "invalid timestamp in `updated_at`: `{updated_at}` ({error})"
            ))
        })?;

    Ok(SystemSetting {
        key,
        value,
        description: row.try_get("description")?,
        is_encrypted: row.try_get("is_encrypted")?,
        updated_at,
    })
}
