use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use steward_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    value: String,
    env_key: Option<&'static str>,
}

impl Field {
    fn new(key: &'static str, value: impl Into<String>, env_key: &'static str) -> Self {
        Self { key, value: value.into(), env_key: Some(env_key) }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    let server_names: Vec<&str> =
        config.tool_servers.iter().map(|server| server.name.as_str()).collect();
    lines.push(render_line(
        "tool_servers",
        &format!("[{}]", server_names.join(", ")),
        field_source("tool_servers", None, config_file_doc.as_ref(), config_file_path.as_deref()),
    ));

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_key(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        Field::new("database.url", config.database.url.clone(), "STEWARD_DATABASE_URL"),
        Field::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            "STEWARD_DATABASE_MAX_CONNECTIONS",
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "STEWARD_DATABASE_TIMEOUT_SECS",
        ),
        Field::new("llm.provider", config.llm.provider.as_str(), "STEWARD_LLM_PROVIDER"),
        Field::new("llm.model", config.llm.model.clone(), "STEWARD_LLM_MODEL"),
        Field::new(
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "STEWARD_LLM_BASE_URL",
        ),
        Field::new("llm.api_key", api_key, "STEWARD_LLM_API_KEY"),
        Field::new("llm.temperature", config.llm.temperature.to_string(), "STEWARD_LLM_TEMPERATURE"),
        Field::new("llm.timeout_secs", config.llm.timeout_secs.to_string(), "STEWARD_LLM_TIMEOUT_SECS"),
        Field::new("llm.max_retries", config.llm.max_retries.to_string(), "STEWARD_LLM_MAX_RETRIES"),
        Field::new("agent.max_steps", config.agent.max_steps.to_string(), "STEWARD_AGENT_MAX_STEPS"),
        Field::new(
            "agent.tool_timeout_secs",
            config.agent.tool_timeout_secs.to_string(),
            "STEWARD_AGENT_TOOL_TIMEOUT_SECS",
        ),
        Field::new(
            "agent.connect_timeout_secs",
            config.agent.connect_timeout_secs.to_string(),
            "STEWARD_AGENT_CONNECT_TIMEOUT_SECS",
        ),
        Field::new(
            "server.bind_address",
            config.server.bind_address.clone(),
            "STEWARD_SERVER_BIND_ADDRESS",
        ),
        Field::new("server.port", config.server.port.to_string(), "STEWARD_SERVER_PORT"),
        Field::new(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "STEWARD_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        Field::new("logging.level", config.logging.level.clone(), "STEWARD_LOGGING_LEVEL"),
        Field::new("logging.format", format!("{:?}", config.logging.format), "STEWARD_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("steward.toml"), PathBuf::from("config/steward.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a provider prefix such as `sk-` visible and hides the rest.
fn redact_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_key};

    #[test]
    fn redaction_keeps_only_the_prefix() {
        assert_eq!(redact_key("sk-live-abcdef"), "sk-***");
        assert_eq!(redact_key("opaque"), "<redacted>");
        assert_eq!(redact_key("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc: Value = "[llm]\nmodel = \"gpt-4o\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.api_key"));
        assert!(!contains_path(&doc, "server.port"));
    }
}
