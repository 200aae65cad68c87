//! The reasoning loop: AGENT and TOOLS steps alternate until the model answers without
//! requesting tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_core::domain::checkpoint::{ConversationState, LoopNode};
use steward_core::domain::message::{Message, MessageKind, ToolCall};

use crate::llm::{bind_tools, ModelFactory};
use crate::tools::ToolFederationRegistry;
use crate::AgentError;

/// Channel name under which finished tool messages are recorded as pending writes.
pub const MESSAGES_CHANNEL: &str = "messages";

/// Receives the durable side effects of a running turn.
#[async_trait]
pub trait StepSink: Send {
    /// One tool call of the current TOOLS step finished.
    async fn record_tool_result(&mut self, call: &ToolCall, message: &Message) -> Result<(), AgentError>;

    /// A step finished; `state` is the state after it and `next` the node to run next.
    async fn commit_step(
        &mut self,
        node: LoopNode,
        state: &ConversationState,
        written: usize,
        next: LoopNode,
    ) -> Result<(), AgentError>;
}

/// Node to run after an AGENT step.
pub fn route_after_agent(state: &ConversationState) -> LoopNode {
    match state.last_message() {
        Some(message) if message.kind() == MessageKind::Ai && !message.tool_calls().is_empty() => {
            LoopNode::Tools
        }
        _ => LoopNode::End,
    }
}

pub struct AgentGraph {
    models: Arc<ModelFactory>,
    registry: Arc<ToolFederationRegistry>,
    system_prompt: String,
    max_steps: u32,
}

impl AgentGraph {
    pub fn new(
        models: Arc<ModelFactory>,
        registry: Arc<ToolFederationRegistry>,
        system_prompt: impl Into<String>,
        max_steps: u32,
    ) -> Self {
        Self { models, registry, system_prompt: system_prompt.into(), max_steps: max_steps.max(1) }
    }

    pub fn registry(&self) -> &Arc<ToolFederationRegistry> {
        &self.registry
    }

    pub fn models(&self) -> &Arc<ModelFactory> {
        &self.models
    }

    /// Runs from `start` until END, committing through `sink` after every step.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        start: LoopNode,
        sink: &mut dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut node = start;
        let mut steps = 0;
        while node != LoopNode::End {
            if steps >= self.max_steps {
                warn!(event_name = "agent.step_limit", max_steps = self.max_steps, "turn hit the step limit");
                return Err(AgentError::StepLimitExceeded(self.max_steps));
            }
            steps += 1;
            node = self.step(node, state, &HashMap::new(), sink, cancel).await?;
        }
        debug!(event_name = "agent.turn_finished", steps, "reasoning loop reached end");
        Ok(())
    }

    /// Runs one step and commits it. `replay` holds tool messages already recorded for the
    /// current tool calls, keyed by tool call id.
    pub async fn step(
        &self,
        node: LoopNode,
        state: &mut ConversationState,
        replay: &HashMap<String, Message>,
        sink: &mut dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<LoopNode, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let (written, next) = match node {
            LoopNode::Agent => {
                let written = self.agent_step(state, cancel).await?;
                (written, route_after_agent(state))
            }
            LoopNode::Tools => (self.tools_step(state, replay, sink).await?, LoopNode::Agent),
            LoopNode::End => return Ok(LoopNode::End),
        };
        sink.commit_step(node, state, written, next).await?;
        Ok(next)
    }

    async fn agent_step(
        &self,
        state: &mut ConversationState,
        cancel: &CancellationToken,
    ) -> Result<usize, AgentError> {
        let inserted = state.ensure_system_instruction(&self.system_prompt);
        let handle = self.models.resolve().await?;
        let descriptors = self.registry.list_tools().await;
        let bound = bind_tools(&handle, &descriptors)?;

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            reply = bound.invoke(&state.messages) => reply?,
        };
        info!(
            event_name = "agent.model_replied",
            provider = handle.provider.as_str(),
            tool_calls = reply.tool_calls().len(),
            "model produced the next message"
        );
        state.messages.push(reply);
        Ok(usize::from(inserted) + 1)
    }

    /// Dispatches every tool call of the last AI message concurrently. Results are appended in
    /// call order once all calls are done; failures become error-status tool messages.
    pub async fn tools_step(
        &self,
        state: &mut ConversationState,
        replay: &HashMap<String, Message>,
        sink: &mut dyn StepSink,
    ) -> Result<usize, AgentError> {
        let calls: Vec<ToolCall> = match state.last_message() {
            Some(message) if message.kind() == MessageKind::Ai => message.tool_calls().to_vec(),
            _ => Vec::new(),
        };
        if calls.is_empty() {
            return Ok(0);
        }

        let mut slots: Vec<Option<Message>> = vec![None; calls.len()];
        let mut tasks = JoinSet::new();
        for (index, call) in calls.iter().enumerate() {
            if let Some(done) = replay.get(&call.id.0) {
                debug!(event_name = "agent.tool_replayed", tool = %call.name, call_id = %call.id.0, "reusing recorded tool result");
                slots[index] = Some(done.clone());
                continue;
            }
            let registry = Arc::clone(&self.registry);
            let call = call.clone();
            tasks.spawn(async move {
                let message = execute_call(&registry, &call).await;
                (index, message)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, message)) => {
                    sink.record_tool_result(&calls[index], &message).await?;
                    slots[index] = Some(message);
                }
                Err(error) => warn!(
                    event_name = "agent.tool_task_failed",
                    error = %error,
                    "tool task ended without a result"
                ),
            }
        }

        let written = calls.len();
        for (call, slot) in calls.iter().zip(slots) {
            let message = slot.unwrap_or_else(|| {
                Message::tool_error(
                    call,
                    format!("Error executing tool {}: tool task ended abnormally", call.name),
                )
            });
            state.messages.push(message);
        }
        Ok(written)
    }
}

async fn execute_call(registry: &ToolFederationRegistry, call: &ToolCall) -> Message {
    let outcome = registry
        .call_tool(&call.name, call.args.clone())
        .await
        .and_then(|result| {
            serde_json::to_string(&result).map_err(|error| {
                steward_core::errors::ToolError::execution(&call.name, error.to_string())
            })
        });

    match outcome {
        Ok(content) => Message::tool_result(call, content),
        Err(error) => {
            warn!(
                event_name = "agent.tool_failed",
                tool = %call.name,
                call_id = %call.id.0,
                error = %error,
                "tool call failed, returning the error to the model"
            );
            Message::tool_error(call, format!("Error executing tool {}: {error}", call.name))
        }
    }
}
