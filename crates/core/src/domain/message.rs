use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallId(pub String);

/// A model-issued request to run one named tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self { id: ToolCallId(id.into()), name: name.into(), args }
    }
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Human,
    Ai,
    Tool,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }

    /// Accepts both the short discriminants and class-style names such as `HumanMessage`.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let normalized = normalized.strip_suffix("chunk").unwrap_or(&normalized);
        let normalized = normalized.strip_suffix("message").unwrap_or(normalized);
        match normalized {
            "human" | "user" => Some(Self::Human),
            "ai" | "assistant" => Some(Self::Ai),
            "tool" => Some(Self::Tool),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One conversation turn. Immutable once appended to a thread's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Human {
        content: String,
    },
    Ai {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: ToolCallId,
        name: String,
        content: String,
        #[serde(default)]
        status: ToolStatus,
    },
    System {
        content: String,
    },
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self::Human { content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::Ai { content: content.into(), tool_calls: Vec::new() }
    }

    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Ai { content: content.into(), tool_calls }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            status: ToolStatus::Success,
        }
    }

    pub fn tool_error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            status: ToolStatus::Error,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Human { .. } => MessageKind::Human,
            Self::Ai { .. } => MessageKind::Ai,
            Self::Tool { .. } => MessageKind::Tool,
            Self::System { .. } => MessageKind::System,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Human { content }
            | Self::Ai { content, .. }
            | Self::Tool { content, .. }
            | Self::System { content } => content,
        }
    }

    /// Tool calls carried by an AI message; empty for every other variant.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Message, MessageKind, ToolCall, ToolStatus};

    #[test]
    fn every_variant_survives_serialization() {
        let call = ToolCall::new("call_1", "crm_get_clients", json!({"limit": 5}));
        let messages = vec![
            Message::system("You are a helpful enterprise assistant."),
            Message::human("List my clients"),
            Message::ai_with_tool_calls("", vec![call.clone()]),
            Message::tool_error(&call, "Error executing tool crm_get_clients: timeout"),
            Message::tool_result(&call, "[]"),
            Message::ai("You have no clients yet."),
        ];

        let encoded = serde_json::to_string(&messages).expect("encode");
        let decoded: Vec<Message> = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, messages);
    }

    #[test]
    fn serialized_form_uses_type_discriminant() {
        let value = serde_json::to_value(Message::human("hi")).expect("encode");
        assert_eq!(value, json!({"type": "human", "content": "hi"}));

        let call = ToolCall::new("call_9", "knowledge_search", json!({"query": "vpn"}));
        let value = serde_json::to_value(Message::tool_error(&call, "boom")).expect("encode");
        assert_eq!(value["status"], "error");
        assert_eq!(value["tool_call_id"], "call_9");
    }

    #[test]
    fn ai_message_without_tool_calls_field_decodes_to_empty_list() {
        let message: Message =
            serde_json::from_value(json!({"type": "ai", "content": "done"})).expect("decode");
        assert!(message.tool_calls().is_empty());
    }

    #[test]
    fn tool_status_defaults_to_success() {
        let message: Message = serde_json::from_value(json!({
            "type": "tool",
            "tool_call_id": "call_1",
            "name": "echo",
            "content": "{}"
        }))
        .expect("decode");
        assert!(matches!(message, Message::Tool { status: ToolStatus::Success, .. }));
    }

    #[test]
    fn kind_parse_accepts_class_style_names() {
        assert_eq!(MessageKind::parse("HumanMessage"), Some(MessageKind::Human));
        assert_eq!(MessageKind::parse("AIMessageChunk"), Some(MessageKind::Ai));
        assert_eq!(MessageKind::parse("tool"), Some(MessageKind::Tool));
        assert_eq!(MessageKind::parse("assistant"), Some(MessageKind::Ai));
        assert_eq!(MessageKind::parse("FunctionMessage"), None);
    }
}
