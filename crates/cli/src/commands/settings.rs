//! Runtime settings stored in the database. Edits apply from the next model step on.

use serde_json::{json, Value};
use steward_core::config::LlmProvider;
use steward_core::settings::{LLM_API_KEY, LLM_PROVIDER};
use steward_db::repositories::SystemSetting;
use steward_db::SqlSettingsRepository;

use crate::commands::session::{self, Failure, EXIT_CONFIG};
use crate::commands::CommandResult;

/// Shows one setting, or every stored setting when no key is given. Sensitive values are masked.
pub fn get(key: Option<&str>) -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let pool = session::open_migrated(&config).await?;
            let repository = SqlSettingsRepository::new(pool.clone());
            let outcome = match key {
                Some(key) => repository.find(key).await.map(|setting| match setting {
                    Some(setting) => {
                        (format!("setting `{key}` is stored"), json!({ "setting": setting_view(&setting) }))
                    }
                    None => (format!("setting `{key}` is not stored"), json!({ "setting": Value::Null })),
                }),
                None => repository.list().await.map(|settings| {
                    let views: Vec<Value> = settings.iter().map(setting_view).collect();
                    (format!("{} setting(s) stored", views.len()), json!({ "settings": views }))
                }),
            };
            pool.close().await;
            outcome.map_err(Failure::from)
        })
    });

    match result {
        Ok((message, data)) => CommandResult::success_with_data("settings", message, data),
        Err(failure) => failure.into_result("settings"),
    }
}

/// Stores `raw` as JSON when it parses, otherwise as a string.
pub fn set(key: &str, raw: &str, description: Option<&str>) -> CommandResult {
    let result = parse_value(key, raw).and_then(|value| {
        session::load_config().and_then(|config| {
            session::block_on(async move {
                let pool = session::open_migrated(&config).await?;
                let repository = SqlSettingsRepository::new(pool.clone());
                let saved = match repository.save(key, &value, description, key == LLM_API_KEY).await {
                    Ok(()) => repository.find(key).await,
                    Err(error) => Err(error),
                };
                pool.close().await;
                Ok::<_, Failure>(saved?.map(|setting| setting_view(&setting)).unwrap_or(Value::Null))
            })
        })
    });

    match result {
        Ok(view) => CommandResult::success_with_data(
            "settings",
            format!("stored setting `{key}`"),
            json!({ "setting": view }),
        ),
        Err(failure) => failure.into_result("settings"),
    }
}

pub fn unset(key: &str) -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let pool = session::open_migrated(&config).await?;
            let removed = SqlSettingsRepository::new(pool.clone()).delete(key).await;
            pool.close().await;
            Ok::<_, Failure>(removed?)
        })
    });

    match result {
        Ok(true) => CommandResult::success("settings", format!("removed setting `{key}`")),
        Ok(false) => CommandResult::success("settings", format!("setting `{key}` was not stored")),
        Err(failure) => failure.into_result("settings"),
    }
}

fn parse_value(key: &str, raw: &str) -> Result<Value, Failure> {
    if key.trim().is_empty() {
        return Err(Failure::new("invalid_input", "setting key must not be blank", EXIT_CONFIG));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    if key == LLM_PROVIDER {
        let known = value.as_str().map(|name| name.parse::<LlmProvider>().is_ok()).unwrap_or(false);
        if !known {
            return Err(Failure::new(
                "invalid_input",
                format!("`{LLM_PROVIDER}` must be `openai` or `anthropic`, got `{raw}`"),
                EXIT_CONFIG,
            ));
        }
    }
    Ok(value)
}

fn setting_view(setting: &SystemSetting) -> Value {
    json!({
        "key": setting.key,
        "value": setting.display_value(),
        "description": setting.description,
        "is_encrypted": setting.is_encrypted,
        "updated_at": setting.updated_at.to_rfc3339(),
    })
}
