//! OpenAI-compatible chat completions with function tools.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};

use steward_core::config::LlmProvider;
use steward_core::domain::message::{Message, ToolCall};

use super::http::send_json;
use super::{ChatModel, ModelSpec};
use crate::AgentError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiChatModel {
    client: reqwest::Client,
    spec: ModelSpec,
}

impl OpenAiChatModel {
    pub fn new(client: reqwest::Client, spec: ModelSpec) -> Self {
        Self { client, spec }
    }

    fn endpoint(&self) -> String {
        let base = self.spec.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn provider(&self) -> LlmProvider {
        LlmProvider::OpenAi
    }

    fn model_name(&self) -> &str {
        &self.spec.model
    }

    async fn complete(&self, messages: &[Message], tools: &[Value]) -> Result<Message, AgentError> {
        let body = request_body(&self.spec, messages, tools);
        let endpoint = self.endpoint();

        let response = send_json("openai", self.spec.max_retries, || {
            let request = self.client.post(&endpoint).timeout(self.spec.timeout).json(&body);
            match &self.spec.api_key {
                Some(key) => request.bearer_auth(key.expose_secret()),
                None => request,
            }
        })
        .await?;

        parse_response(response)
    }
}

fn request_body(spec: &ModelSpec, messages: &[Message], tools: &[Value]) -> Value {
    let mut body = json!({
        "model": spec.model,
        "temperature": spec.temperature,
        "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
        body["tool_choice"] = json!("auto");
    }
    body
}

fn wire_message(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({ "role": "system", "content": content }),
        Message::Human { content } => json!({ "role": "user", "content": content }),
        Message::Ai { content, tool_calls } if tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": content })
        }
        Message::Ai { content, tool_calls } => json!({
            "role": "assistant",
            "content": if content.is_empty() { Value::Null } else { json!(content) },
            "tool_calls": tool_calls.iter().map(|call| json!({
                "id": call.id.0,
                "type": "function",
                "function": { "name": call.name, "arguments": call.args.to_string() },
            })).collect::<Vec<_>>(),
        }),
        Message::Tool { tool_call_id, content, .. } => {
            json!({ "role": "tool", "tool_call_id": tool_call_id.0, "content": content })
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_response(response: Value) -> Result<Message, AgentError> {
    let parsed: CompletionResponse = serde_json::from_value(response)
        .map_err(|error| AgentError::Model(format!("unexpected openai response shape: {error}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Model("openai response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall::new(call.id, call.function.name, parse_arguments(&call.function.arguments)))
        .collect();

    Ok(Message::ai_with_tool_calls(choice.message.content.unwrap_or_default(), tool_calls))
}

/// Arguments arrive as a JSON-encoded string; undecodable text is passed through as a string.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use steward_core::domain::message::{Message, ToolCall};

    use super::{parse_response, wire_message};

    #[test]
    fn tool_calls_are_decoded_from_function_arguments() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "crm_get_clients", "arguments": "{\"limit\":5}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });

        let message = parse_response(response).expect("parse");
        assert_eq!(message.content(), "");
        assert_eq!(message.tool_calls(), &[ToolCall::new("call_1", "crm_get_clients", json!({"limit": 5}))]);
    }

    #[test]
    fn assistant_tool_calls_are_sent_with_encoded_arguments() {
        let call = ToolCall::new("call_1", "echo", json!({"x": 1}));
        let wire = wire_message(&Message::ai_with_tool_calls("", vec![call.clone()]));

        assert_eq!(wire["content"], serde_json::Value::Null);
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], json!("{\"x\":1}"));

        let result = wire_message(&Message::tool_result(&call, "{\"x\":1}"));
        assert_eq!(result, json!({"role": "tool", "tool_call_id": "call_1", "content": "{\"x\":1}"}));
    }

    #[test]
    fn empty_choices_are_a_model_error() {
        let error = parse_response(json!({"choices": []})).expect_err("no choices");
        assert!(error.to_string().contains("no choices"));
    }
}
