//! Runtime-editable key/value settings. Missing keys mean "use the configured default".

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::ApplicationError;

pub const LLM_PROVIDER: &str = "llm_provider";
pub const LLM_MODEL_NAME: &str = "llm_model_name";
pub const LLM_API_KEY: &str = "llm_api_key";

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, ApplicationError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), ApplicationError>;

    /// Reads a setting as text. Non-string JSON values are ignored.
    async fn get_string(&self, key: &str) -> Result<Option<String>, ApplicationError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|value| !value.trim().is_empty()))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsProvider for InMemorySettings {
    async fn get(&self, key: &str) -> Result<Option<Value>, ApplicationError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ApplicationError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{InMemorySettings, SettingsProvider, LLM_MODEL_NAME, LLM_PROVIDER};

    #[tokio::test]
    async fn get_string_ignores_blank_and_non_string_values() {
        let settings = InMemorySettings::new();
        settings.set(LLM_PROVIDER, json!("  ")).await.expect("set");
        settings.set(LLM_MODEL_NAME, json!(42)).await.expect("set");

        assert_eq!(settings.get_string(LLM_PROVIDER).await.expect("get"), None);
        assert_eq!(settings.get_string(LLM_MODEL_NAME).await.expect("get"), None);

        settings.set(LLM_PROVIDER, json!("anthropic")).await.expect("set");
        assert_eq!(
            settings.get_string(LLM_PROVIDER).await.expect("get").as_deref(),
            Some("anthropic")
        );
    }
}
