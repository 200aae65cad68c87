//! Anthropic messages API.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use steward_core::config::LlmProvider;
use steward_core::domain::message::{Message, ToolCall, ToolStatus};

use super::http::send_json;
use super::{ChatModel, ModelSpec};
use crate::AgentError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicChatModel {
    client: reqwest::Client,
    spec: ModelSpec,
}

impl AnthropicChatModel {
    pub fn new(client: reqwest::Client, spec: ModelSpec) -> Self {
        Self { client, spec }
    }

    fn endpoint(&self) -> String {
        let base = self.spec.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Anthropic
    }

    fn model_name(&self) -> &str {
        &self.spec.model
    }

    async fn complete(&self, messages: &[Message], tools: &[Value]) -> Result<Message, AgentError> {
        let body = request_body(&self.spec, messages, tools);
        let endpoint = self.endpoint();

        let response = send_json("anthropic", self.spec.max_retries, || {
            let request = self
                .client
                .post(&endpoint)
                .timeout(self.spec.timeout)
                .header("anthropic-version", API_VERSION)
                .json(&body);
            match &self.spec.api_key {
                Some(key) => request.header("x-api-key", key.expose_secret()),
                None => request,
            }
        })
        .await?;

        parse_response(&response)
    }
}

fn request_body(spec: &ModelSpec, messages: &[Message], tools: &[Value]) -> Value {
    let system: Vec<&str> =
        messages.iter().filter(|message| message.is_system()).map(Message::content).collect();

    let mut body = json!({
        "model": spec.model,
        "max_tokens": MAX_TOKENS,
        "temperature": spec.temperature,
        "messages": wire_messages(messages),
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
    }
    body
}

/// System messages travel in the top-level `system` field; consecutive tool results are
/// merged into one user turn because the API requires strictly alternating roles.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::new();
    for message in messages {
        match message {
            Message::System { .. } => {}
            Message::Human { content } => wire.push(json!({ "role": "user", "content": content })),
            Message::Ai { content, tool_calls } => {
                let mut blocks = Vec::new();
                if !content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": content }));
                }
                blocks.extend(tool_calls.iter().map(|call| {
                    json!({ "type": "tool_use", "id": call.id.0, "name": call.name, "input": call.args })
                }));
                wire.push(json!({ "role": "assistant", "content": blocks }));
            }
            Message::Tool { tool_call_id, content, status, .. } => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id.0,
                    "content": content,
                    "is_error": *status == ToolStatus::Error,
                });
                match wire.last_mut() {
                    Some(previous) if is_tool_result_turn(previous) => {
                        if let Some(blocks) = previous["content"].as_array_mut() {
                            blocks.push(block);
                        }
                    }
                    _ => wire.push(json!({ "role": "user", "content": [block] })),
                }
            }
        }
    }
    wire
}

fn is_tool_result_turn(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .is_some_and(|blocks| blocks.iter().all(|block| block["type"] == "tool_result"))
}

fn parse_response(response: &Value) -> Result<Message, AgentError> {
    let blocks = response["content"]
        .as_array()
        .ok_or_else(|| AgentError::Model("anthropic response has no content blocks".to_string()))?;

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => text.push(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall::new(
                block["id"].as_str().unwrap_or_default(),
                block["name"].as_str().unwrap_or_default(),
                block.get("input").cloned().unwrap_or_else(|| json!({})),
            )),
            _ => {}
        }
    }

    Ok(Message::ai_with_tool_calls(text.join(""), tool_calls))
}
