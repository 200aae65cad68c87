//! Model adapter: resolves the configured chat model on every call and binds tools in
//! the provider's declaration shape.

mod anthropic;
mod http;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use steward_core::config::{LlmConfig, LlmProvider};
use steward_core::domain::message::{Message, MessageKind};
use steward_core::domain::tool::ToolDescriptor;
use steward_core::settings::{SettingsProvider, LLM_API_KEY, LLM_MODEL_NAME, LLM_PROVIDER};

pub use anthropic::AnthropicChatModel;
pub use openai::OpenAiChatModel;

use crate::AgentError;

const DEFAULT_PROVIDER: LlmProvider = LlmProvider::OpenAi;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn provider(&self) -> LlmProvider;

    fn model_name(&self) -> &str;

    /// Whether the model takes tool declarations at all.
    fn accepts_tools(&self) -> bool {
        true
    }

    /// Runs one completion over the full history. `tools` are already in the provider's shape.
    async fn complete(&self, messages: &[Message], tools: &[Value]) -> Result<Message, AgentError>;
}

/// Everything needed to build a model client for one step.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: u32,
}

pub trait ModelBuilder: Send + Sync {
    fn build(&self, spec: ModelSpec) -> Result<Arc<dyn ChatModel>, AgentError>;
}

/// Builds HTTP clients for the hosted providers, sharing one connection pool.
pub struct HttpModelBuilder {
    client: reqwest::Client,
}

impl HttpModelBuilder {
    pub fn new() -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().build().map_err(|error| {
            AgentError::Configuration(format!("could not build HTTP client: {error}"))
        })?;
        Ok(Self { client })
    }
}

impl ModelBuilder for HttpModelBuilder {
    fn build(&self, spec: ModelSpec) -> Result<Arc<dyn ChatModel>, AgentError> {
        if spec.api_key.is_none() && spec.base_url.is_none() {
            return Err(AgentError::Configuration(format!(
                "no API key configured for provider `{}`; set `{LLM_API_KEY}`, `llm.api_key` or {}",
                spec.provider.as_str(),
                provider_key_env(spec.provider)
            )));
        }
        Ok(match spec.provider {
            LlmProvider::OpenAi => Arc::new(OpenAiChatModel::new(self.client.clone(), spec)),
            LlmProvider::Anthropic => Arc::new(AnthropicChatModel::new(self.client.clone(), spec)),
        })
    }
}

fn provider_key_env(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "OPENAI_API_KEY",
        LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
    }
}

#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn ChatModel>,
    pub provider: LlmProvider,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("provider", &self.provider)
            .field("model", &self.model.model_name())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelProbe {
    pub provider: String,
    pub model: String,
    pub reply: String,
}

/// Resolves the chat model from runtime settings, falling back to the file/env config.
pub struct ModelFactory {
    settings: Arc<dyn SettingsProvider>,
    defaults: LlmConfig,
    builder: Arc<dyn ModelBuilder>,
}

impl ModelFactory {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        defaults: LlmConfig,
        builder: Arc<dyn ModelBuilder>,
    ) -> Self {
        Self { settings, defaults, builder }
    }

    /// Reads the settings on every call so edits apply from the next step on.
    pub async fn resolve(&self) -> Result<ModelHandle, AgentError> {
        let spec = self.resolve_spec().await?;
        debug!(
            event_name = "llm.model_resolved",
            provider = spec.provider.as_str(),
            model = %spec.model,
            "resolved chat model"
        );
        let provider = spec.provider;
        let model = self.builder.build(spec)?;
        Ok(ModelHandle { model, provider })
    }

    /// Sends one human message without tools and reports the reply.
    pub async fn probe(&self, text: &str) -> Result<ModelProbe, AgentError> {
        let handle = self.resolve().await?;
        let reply = handle.model.complete(&[Message::human(text)], &[]).await?;
        Ok(ModelProbe {
            provider: handle.provider.as_str().to_string(),
            model: handle.model.model_name().to_string(),
            reply: reply.content().to_string(),
        })
    }

    async fn resolve_spec(&self) -> Result<ModelSpec, AgentError> {
        let provider = match self.setting(LLM_PROVIDER).await? {
            Some(raw) => raw.parse::<LlmProvider>().unwrap_or_else(|_| {
                warn!(
                    event_name = "llm.unsupported_provider",
                    requested = %raw,
                    fallback = DEFAULT_PROVIDER.as_str(),
                    "unsupported llm provider in settings, using the default provider"
                );
                DEFAULT_PROVIDER
            }),
            None => self.defaults.provider,
        };
        let model = self.setting(LLM_MODEL_NAME).await?.unwrap_or_else(|| self.defaults.model.clone());
        let api_key = match self.setting(LLM_API_KEY).await? {
            Some(key) => Some(SecretString::from(key)),
            None => self.defaults.api_key.clone().or_else(|| {
                std::env::var(provider_key_env(provider))
                    .ok()
                    .filter(|key| !key.trim().is_empty())
                    .map(SecretString::from)
            }),
        };

        Ok(ModelSpec {
            provider,
            model,
            api_key,
            base_url: self.defaults.base_url.clone(),
            temperature: self.defaults.temperature,
            timeout: Duration::from_secs(self.defaults.timeout_secs),
            max_retries: self.defaults.max_retries,
        })
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, AgentError> {
        self.settings.get_string(key).await.map_err(AgentError::Settings)
    }
}

/// Maps canonical descriptors to the provider's tool declaration shape.
pub fn to_provider_tools(provider: LlmProvider, descriptors: &[ToolDescriptor]) -> Vec<Value> {
    descriptors
        .iter()
        .map(|tool| match provider {
            LlmProvider::OpenAi => json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                },
            }),
            LlmProvider::Anthropic => json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            }),
        })
        .collect()
}

/// A model with its tool declarations attached.
pub struct BoundModel {
    model: Arc<dyn ChatModel>,
    tools: Vec<Value>,
}

impl BoundModel {
    pub async fn invoke(&self, messages: &[Message]) -> Result<Message, AgentError> {
        let reply = self.model.complete(messages, &self.tools).await?;
        if reply.kind() != MessageKind::Ai {
            return Err(AgentError::Model(format!(
                "model `{}` replied with a `{}` message",
                self.model.model_name(),
                reply.kind().as_str()
            )));
        }
        Ok(reply)
    }
}

/// Fails when the model cannot take tool declarations; a silently tool-less agent is never
/// returned.
pub fn bind_tools(
    handle: &ModelHandle,
    descriptors: &[ToolDescriptor],
) -> Result<BoundModel, AgentError> {
    if !handle.model.accepts_tools() {
        return Err(AgentError::Configuration(format!(
            "model `{}` ({}) does not accept tool declarations",
            handle.model.model_name(),
            handle.provider.as_str()
        )));
    }
    Ok(BoundModel {
        model: Arc::clone(&handle.model),
        tools: to_provider_tools(handle.provider, descriptors),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use serde_json::{json, Value};

    use steward_core::config::{AppConfig, LlmProvider};
    use steward_core::domain::message::Message;
    use steward_core::domain::tool::ToolDescriptor;
    use steward_core::settings::{
        InMemorySettings, SettingsProvider, LLM_API_KEY, LLM_MODEL_NAME, LLM_PROVIDER,
    };

    use super::{
        bind_tools, to_provider_tools, ChatModel, ModelBuilder, ModelFactory, ModelHandle,
        ModelSpec,
    };
    use crate::AgentError;

    struct FixedModel {
        spec: ModelSpec,
        accepts_tools: bool,
    }

    #[async_trait]
    impl ChatModel for FixedModel {
        fn provider(&self) -> LlmProvider {
            self.spec.provider
        }

        fn model_name(&self) -> &str {
            &self.spec.model
        }

        fn accepts_tools(&self) -> bool {
            self.accepts_tools
        }

        async fn complete(&self, messages: &[Message], _tools: &[Value]) -> Result<Message, AgentError> {
            let last = messages.last().map(Message::content).unwrap_or_default();
            Ok(Message::ai(format!("pong: {last}")))
        }
    }

    #[derive(Default)]
    struct RecordingBuilder {
        specs: Mutex<Vec<ModelSpec>>,
    }

    impl ModelBuilder for RecordingBuilder {
        fn build(&self, spec: ModelSpec) -> Result<Arc<dyn ChatModel>, AgentError> {
            self.specs.lock().expect("lock").push(spec.clone());
            Ok(Arc::new(FixedModel { spec, accepts_tools: true }))
        }
    }

    fn factory(settings: Arc<InMemorySettings>, builder: Arc<RecordingBuilder>) -> ModelFactory {
        let mut defaults = AppConfig::default().llm;
        defaults.api_key = Some("sk-config".to_string().into());
        ModelFactory::new(settings, defaults, builder)
    }

    fn crm_tool() -> ToolDescriptor {
        ToolDescriptor::new(
            "crm_get_clients",
            "List CRM clients",
            json!({"type": "object", "properties": {"limit": {"type": "integer"}}}),
        )
    }

    #[tokio::test]
    async fn missing_settings_fall_back_to_config_defaults() {
        let builder = Arc::new(RecordingBuilder::default());
        let handle = factory(Arc::new(InMemorySettings::new()), builder.clone())
            .resolve()
            .await
            .expect("resolve");

        assert_eq!(handle.provider, LlmProvider::OpenAi);
        assert_eq!(handle.model.model_name(), "gpt-4o");
        let specs = builder.specs.lock().expect("lock");
        assert_eq!(specs[0].api_key.as_ref().map(|key| key.expose_secret().to_string()), Some("sk-config".into()));
    }

    #[tokio::test]
    async fn settings_are_read_on_every_resolve() {
        let settings = Arc::new(InMemorySettings::new());
        let builder = Arc::new(RecordingBuilder::default());
        let factory = factory(settings.clone(), builder.clone());

        assert_eq!(factory.resolve().await.expect("resolve").provider, LlmProvider::OpenAi);

        settings.set(LLM_PROVIDER, json!("anthropic")).await.expect("set");
        settings.set(LLM_MODEL_NAME, json!("claude-3-5-sonnet-latest")).await.expect("set");
        settings.set(LLM_API_KEY, json!("sk-settings")).await.expect("set");
        let handle = factory.resolve().await.expect("resolve");

        assert_eq!(handle.provider, LlmProvider::Anthropic);
        assert_eq!(handle.model.model_name(), "claude-3-5-sonnet-latest");
        let specs = builder.specs.lock().expect("lock");
        assert_eq!(specs[1].api_key.as_ref().map(|key| key.expose_secret().to_string()), Some("sk-settings".into()));
    }

    #[tokio::test]
    async fn unsupported_provider_falls_back_to_openai() {
        let settings = Arc::new(InMemorySettings::new());
        settings.set(LLM_PROVIDER, json!("cohere")).await.expect("set");

        let handle = factory(settings, Arc::new(RecordingBuilder::default()))
            .resolve()
            .await
            .expect("unsupported provider is not fatal");
        assert_eq!(handle.provider, LlmProvider::OpenAi);
    }

    #[tokio::test]
    async fn probe_reports_the_reply() {
        let probe = factory(Arc::new(InMemorySettings::new()), Arc::new(RecordingBuilder::default()))
            .probe("ping")
            .await
            .expect("probe");
        assert_eq!(probe.provider, "openai");
        assert_eq!(probe.reply, "pong: ping");
    }

    #[test]
    fn provider_tool_shapes_differ_by_provider() {
        let openai = to_provider_tools(LlmProvider::OpenAi, &[crm_tool()]);
        assert_eq!(openai[0]["type"], "function");
        assert_eq!(openai[0]["function"]["name"], "crm_get_clients");
        assert_eq!(openai[0]["function"]["parameters"]["type"], "object");

        let anthropic = to_provider_tools(LlmProvider::Anthropic, &[crm_tool()]);
        assert_eq!(anthropic[0]["name"], "crm_get_clients");
        assert_eq!(anthropic[0]["input_schema"]["properties"]["limit"]["type"], "integer");
        assert!(anthropic[0].get("type").is_none());
    }

    #[test]
    fn binding_tools_to_a_tool_less_model_is_a_configuration_error() {
        let spec = ModelSpec {
            provider: LlmProvider::OpenAi,
            model: "completion-only".into(),
            api_key: None,
            base_url: None,
            temperature: 0.0,
            timeout: std::time::Duration::from_secs(1),
            max_retries: 0,
        };
        let handle = ModelHandle {
            model: Arc::new(FixedModel { spec, accepts_tools: false }),
            provider: LlmProvider::OpenAi,
        };

        let error = bind_tools(&handle, &[crm_tool()]).err().expect("must fail");
        assert!(matches!(error, AgentError::Configuration(ref message) if message.contains("completion-only")));
    }
}
