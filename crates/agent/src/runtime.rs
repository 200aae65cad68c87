use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steward_core::domain::checkpoint::{
    ChannelWrite, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, ConversationState, LoopNode, ThreadId,
};
use steward_core::domain::message::{Message, MessageKind, ToolCall};
use steward_db::{CheckpointHistory, CheckpointStore, ThreadSummary};

use crate::graph::{AgentGraph, StepSink, MESSAGES_CHANNEL};
use crate::AgentError;

const HISTORY_PAGE_SIZE: u32 = 50;

/// Transport-safe view of one message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub tool_outputs: Vec<Value>,
}

impl From<&Message> for NormalizedMessage {
    fn from(message: &Message) -> Self {
        Self {
            kind: message.kind().as_str().to_string(),
            content: Value::String(message.content().to_string()),
            tool_calls: message
                .tool_calls()
                .iter()
                .filter_map(|call| serde_json::to_value(call).ok())
                .collect(),
            tool_outputs: Vec::new(),
        }
    }
}

/// Normalizes a message that arrives as plain JSON rather than a typed [`Message`]: the
/// `type` field decides the kind, falling back to the last element of an `id` path such as
/// `["langchain_core", "messages", "HumanMessage"]`. Fields may sit under `kwargs`.
pub fn normalize_value(value: &Value) -> Option<NormalizedMessage> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(MessageKind::parse)
        .or_else(|| {
            value
                .get("id")
                .and_then(Value::as_array)
                .and_then(|path| path.last())
                .and_then(Value::as_str)
                .and_then(MessageKind::parse)
        })?;

    let field = |name: &str| {
        value.get(name).or_else(|| value.get("kwargs").and_then(|kwargs| kwargs.get(name)))
    };
    let list = |name: &str| field(name).and_then(Value::as_array).cloned().unwrap_or_default();

    Some(NormalizedMessage {
        kind: kind.as_str().to_string(),
        content: field("content").cloned().unwrap_or_else(|| Value::String(String::new())),
        tool_calls: list("tool_calls"),
        tool_outputs: list("tool_outputs"),
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeOutput {
    pub messages: Vec<NormalizedMessage>,
}

impl InvokeOutput {
    pub fn from_messages(messages: &[Message]) -> Self {
        Self { messages: messages.iter().map(NormalizedMessage::from).collect() }
    }
}

/// Binds the reasoning loop to a checkpoint store. Turns on one thread run one at a time;
/// different threads run in parallel.
pub struct Runner {
    graph: AgentGraph,
    store: Arc<dyn CheckpointStore>,
    thread_locks: Mutex<HashMap<ThreadId, Arc<Mutex<()>>>>,
}

impl Runner {
    pub fn new(graph: AgentGraph, store: Arc<dyn CheckpointStore>) -> Self {
        Self { graph, store, thread_locks: Mutex::new(HashMap::new()) }
    }

    pub fn graph(&self) -> &AgentGraph {
        &self.graph
    }

    pub async fn invoke(&self, text: &str, thread_id: &str) -> Result<InvokeOutput, AgentError> {
        self.invoke_with_cancel(text, thread_id, CancellationToken::new()).await
    }

    pub async fn invoke_with_cancel(
        &self,
        text: &str,
        thread_id: &str,
        cancel: CancellationToken,
    ) -> Result<InvokeOutput, AgentError> {
        let thread_id = ThreadId(thread_id.to_string());
        let lock = self.thread_lock(&thread_id).await;
        let _turn = lock.lock().await;

        let latest = self.store.get_tuple(&thread_id, None).await?;
        let mut sink = ThreadCheckpointer::resume(self.store.as_ref(), thread_id.clone(), latest.as_ref());
        let mut state = latest
            .as_ref()
            .map(|tuple| tuple.checkpoint.state.clone())
            .unwrap_or_default();

        if let Some(tuple) = latest.as_ref().filter(|tuple| tuple.checkpoint.next == LoopNode::Tools) {
            let replay = replayable_results(tuple);
            info!(
                event_name = "agent.resuming_tools",
                thread_id = %thread_id,
                checkpoint_id = %tuple.checkpoint.id,
                replayed = replay.len(),
                "finishing an interrupted tool step"
            );
            self.graph.step(LoopNode::Tools, &mut state, &replay, &mut sink, &cancel).await?;
        }

        state.messages.push(Message::human(text));
        self.graph.run(&mut state, LoopNode::Agent, &mut sink, &cancel).await?;

        info!(
            event_name = "agent.turn_completed",
            thread_id = %thread_id,
            message_count = state.messages.len(),
            checkpoints_written = sink.committed,
            "turn completed"
        );
        Ok(InvokeOutput::from_messages(&state.messages))
    }

    /// Messages of the latest checkpoint, empty for an unknown thread. A thread stopped inside a
    /// tool step also lists the tool results recorded so far.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<NormalizedMessage>, AgentError> {
        let Some(tuple) = self.store.get_tuple(&ThreadId(thread_id.to_string()), None).await? else {
            return Ok(Vec::new());
        };
        let mut messages = InvokeOutput::from_messages(&tuple.checkpoint.state.messages).messages;
        if tuple.checkpoint.next == LoopNode::Tools {
            messages.extend(
                tuple
                    .pending_writes
                    .iter()
                    .filter(|write| write.channel == MESSAGES_CHANNEL)
                    .filter_map(|write| normalize_value(&write.value)),
            );
        }
        Ok(messages)
    }

    /// Every checkpoint of the thread, newest first.
    pub async fn checkpoints(&self, thread_id: &str) -> Result<Vec<CheckpointTuple>, AgentError> {
        let history = CheckpointHistory::new(
            self.store.as_ref(),
            ThreadId(thread_id.to_string()),
            HISTORY_PAGE_SIZE,
        );
        Ok(history.collect_all().await?)
    }

    pub async fn threads(&self) -> Result<Vec<ThreadSummary>, AgentError> {
        Ok(self.store.list_threads().await?)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<(), AgentError> {
        let thread_id = ThreadId(thread_id.to_string());
        let lock = self.thread_lock(&thread_id).await;
        let _turn = lock.lock().await;
        self.store.delete_thread(&thread_id).await?;
        info!(event_name = "agent.thread_deleted", thread_id = %thread_id, "thread deleted");
        Ok(())
    }

    async fn thread_lock(&self, thread_id: &ThreadId) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(thread_id.clone()).or_default())
    }
}

fn replayable_results(tuple: &CheckpointTuple) -> HashMap<String, Message> {
    tuple
        .pending_writes
        .iter()
        .filter(|write| write.channel == MESSAGES_CHANNEL)
        .filter_map(|write| match serde_json::from_value::<Message>(write.value.clone()) {
            Ok(message) => Some((write.task_id.clone(), message)),
            Err(error) => {
                warn!(
                    event_name = "agent.pending_write_undecodable",
                    task_id = %write.task_id,
                    error = %error,
                    "ignoring pending write that does not decode as a message"
                );
                None
            }
        })
        .collect()
}

/// Commits one checkpoint per step, each chained to the previous one.
struct ThreadCheckpointer<'a> {
    store: &'a dyn CheckpointStore,
    thread_id: ThreadId,
    head: Option<CheckpointId>,
    step: i64,
    source: CheckpointSource,
    committed: usize,
}

impl<'a> ThreadCheckpointer<'a> {
    fn resume(
        store: &'a dyn CheckpointStore,
        thread_id: ThreadId,
        latest: Option<&CheckpointTuple>,
    ) -> Self {
        let source = match latest {
            Some(tuple) if tuple.checkpoint.next == LoopNode::Tools => CheckpointSource::Resume,
            _ => CheckpointSource::Loop,
        };
        Self {
            store,
            thread_id,
            head: latest.map(|tuple| tuple.checkpoint.id.clone()),
            step: latest.map(|tuple| tuple.metadata.step).unwrap_or(0),
            source,
            committed: 0,
        }
    }
}

#[async_trait]
impl<'a> StepSink for ThreadCheckpointer<'a> {
    async fn record_tool_result(&mut self, call: &ToolCall, message: &Message) -> Result<(), AgentError> {
        let Some(head) = &self.head else {
            return Ok(());
        };
        let value = serde_json::to_value(message).map_err(|error| {
            AgentError::Model(format!("tool message for `{}` is not serializable: {error}", call.name))
        })?;
        self.store
            .put_writes(&self.thread_id, head, &[ChannelWrite::new(MESSAGES_CHANNEL, value)], &call.id.0)
            .await?;
        Ok(())
    }

    async fn commit_step(
        &mut self,
        node: LoopNode,
        state: &ConversationState,
        written: usize,
        next: LoopNode,
    ) -> Result<(), AgentError> {
        self.step += 1;
        let checkpoint = Checkpoint::new(state.clone(), next);
        let metadata = CheckpointMetadata::for_step(self.source, self.step, node, written);
        self.store.put(&self.thread_id, self.head.as_ref(), &checkpoint, &metadata).await?;

        self.head = Some(checkpoint.id);
        self.source = CheckpointSource::Loop;
        self.committed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use steward_core::domain::checkpoint::{
        ChannelWrite, Checkpoint, CheckpointMetadata, CheckpointSource, ConversationState,
        LoopNode, ThreadId,
    };
    use steward_core::domain::message::{Message, ToolCall};
    use steward_core::domain::tool::{empty_object_schema, InProcessTool, ToolDescriptor};
    use steward_core::errors::ToolError;
    use steward_db::{CheckpointStore, InMemoryCheckpointStore};

    use super::{normalize_value, Runner, MESSAGES_CHANNEL};
    use crate::graph::test_support::{factory, registry, EchoTool, ScriptedModel};
    use crate::graph::AgentGraph;
    use crate::AgentError;

    fn runner(model: Arc<ScriptedModel>, store: Arc<InMemoryCheckpointStore>) -> Runner {
        runner_with_tools(model, store, vec![Arc::new(EchoTool)])
    }

    fn runner_with_tools(
        model: Arc<ScriptedModel>,
        store: Arc<InMemoryCheckpointStore>,
        tools: Vec<Arc<dyn InProcessTool>>,
    ) -> Runner {
        let graph = AgentGraph::new(factory(model), registry(tools), "You are a test assistant.", 10);
        Runner::new(graph, store)
    }

    fn thread(id: &str) -> ThreadId {
        ThreadId(id.to_string())
    }

    #[tokio::test]
    async fn echo_turn_commits_exactly_one_checkpoint() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let runner = runner(Arc::new(ScriptedModel::default()), store.clone());

        let output = runner.invoke("Hello, world!", "thread-A").await.expect("invoke");

        let last = output.messages.last().expect("messages");
        assert_eq!(last.kind, "ai");
        assert!(last.content.as_str().unwrap_or_default().contains("Echo: Hello, world!"));
        assert_eq!(store.list(&thread("thread-A"), None, None).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn second_turn_sees_the_first_and_keeps_one_system_message() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let model = Arc::new(ScriptedModel::default());
        let runner = runner(model.clone(), store);

        runner.invoke("first question", "thread-B").await.expect("first");
        let output = runner.invoke("second question", "thread-B").await.expect("second");

        let second_prompt = model.prompts().last().cloned().expect("prompt");
        assert!(second_prompt.contains(&Message::human("first question")));
        assert!(second_prompt.contains(&Message::ai("Echo: first question")));
        assert_eq!(second_prompt.iter().filter(|message| message.is_system()).count(), 1);
        assert_eq!(output.messages.iter().filter(|message| message.kind == "system").count(), 1);
        assert_eq!(output.messages.len(), 5);
    }

    #[tokio::test]
    async fn each_step_is_checkpointed_in_a_single_chain() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let model = Arc::new(ScriptedModel::with_replies(vec![Message::ai_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "echo", json!({"x": 1}))],
        )]));
        let runner = runner(model, store.clone());

        runner.invoke("use the tool", "thread-C").await.expect("invoke");

        let checkpoints = runner.checkpoints("thread-C").await.expect("history");
        assert_eq!(checkpoints.len(), 3);
        let nodes: Vec<LoopNode> = checkpoints.iter().map(|tuple| tuple.checkpoint.next).collect();
        assert_eq!(nodes, vec![LoopNode::End, LoopNode::Agent, LoopNode::Tools]);
        assert!(checkpoints[2].parent.is_none());
        assert_eq!(
            checkpoints[0].parent.as_ref().map(|parent| &parent.checkpoint_id),
            Some(&checkpoints[1].checkpoint.id)
        );
        let tool_checkpoint = store
            .get_tuple(&thread("thread-C"), Some(&checkpoints[2].checkpoint.id))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(tool_checkpoint.pending_writes.len(), 1, "finished call recorded as a pending write");
        assert_eq!(tool_checkpoint.pending_writes[0].task_id, "call_1");
    }

    struct CountingTool(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl InProcessTool for CountingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("send_email", "Sends an email", empty_object_schema())
        }

        async fn call(&self, _args: Value) -> Result<Value, ToolError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(json!({"sent": true}))
        }
    }

    #[tokio::test]
    async fn interrupted_tool_step_replays_recorded_results() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let sent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let runner = runner_with_tools(
            Arc::new(ScriptedModel::default()),
            store.clone(),
            vec![Arc::new(EchoTool), Arc::new(CountingTool(sent.clone()))],
        );

        let email = ToolCall::new("call_email", "send_email", json!({"to": "ops@example.com"}));
        let echo = ToolCall::new("call_echo", "echo", json!({"x": 1}));
        let interrupted = Checkpoint::new(
            ConversationState {
                messages: vec![
                    Message::system("You are a test assistant."),
                    Message::human("email ops"),
                    Message::ai_with_tool_calls("", vec![email.clone(), echo]),
                ],
            },
            LoopNode::Tools,
        );
        store
            .put(
                &thread("thread-D"),
                None,
                &interrupted,
                &CheckpointMetadata::for_step(CheckpointSource::Loop, 1, LoopNode::Agent, 3),
            )
            .await
            .expect("put");
        let recorded = serde_json::to_value(Message::tool_result(&email, "{\"sent\":true}")).expect("encode");
        store
            .put_writes(&thread("thread-D"), &interrupted.id, &[ChannelWrite::new(MESSAGES_CHANNEL, recorded)], "call_email")
            .await
            .expect("writes");

        let output = runner.invoke("did it work?", "thread-D").await.expect("invoke");

        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 0, "email is not sent twice");
        let kinds: Vec<&str> = output.messages.iter().map(|message| message.kind.as_str()).collect();
        assert_eq!(kinds, vec!["system", "human", "ai", "tool", "tool", "human", "ai"]);
        assert_eq!(output.messages[3].content, json!("{\"sent\":true}"));
        assert_eq!(output.messages[4].content, json!("{\"x\":1}"));

        let newest = store.list(&thread("thread-D"), None, Some(2)).await.expect("list");
        assert_eq!(newest[1].metadata.source, CheckpointSource::Resume);
    }

    #[tokio::test]
    async fn turns_on_one_thread_are_serialized() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let model = Arc::new(ScriptedModel { delay: Some(Duration::from_millis(30)), ..ScriptedModel::default() });
        let runner = Arc::new(runner(model, store.clone()));

        let first = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.invoke("one", "thread-E").await })
        };
        let second = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.invoke("two", "thread-E").await })
        };
        first.await.expect("join").expect("first turn");
        second.await.expect("join").expect("second turn");

        let history = runner.history("thread-E").await.expect("history");
        let humans = history.iter().filter(|message| message.kind == "human").count();
        assert_eq!(humans, 2, "the later turn builds on the earlier one instead of racing it");
        assert_eq!(store.list(&thread("thread-E"), None, None).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn cancellation_during_the_model_call_commits_nothing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let model = Arc::new(ScriptedModel { delay: Some(Duration::from_secs(5)), ..ScriptedModel::default() });
        let runner = runner(model, store.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let error = runner.invoke_with_cancel("hi", "thread-F", cancel).await.expect_err("cancelled");
        assert!(matches!(error, AgentError::Cancelled));
        assert!(store.get_tuple(&thread("thread-F"), None).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_thread_forgets_the_conversation() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let runner = runner(Arc::new(ScriptedModel::default()), store);
        runner.invoke("remember me", "thread-G").await.expect("invoke");

        runner.delete_thread("thread-G").await.expect("delete");
        assert!(runner.history("thread-G").await.expect("history").is_empty());
        assert!(runner.threads().await.expect("threads").is_empty());
    }

    #[tokio::test]
    async fn history_of_an_interrupted_tool_step_lists_recorded_results() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let runner = runner(Arc::new(ScriptedModel::default()), store.clone());

        let lookup = ToolCall::new("call_lookup", "echo", json!({"q": "vpn"}));
        let interrupted = Checkpoint::new(
            ConversationState {
                messages: vec![Message::human("look it up"), Message::ai_with_tool_calls("", vec![lookup.clone()])],
            },
            LoopNode::Tools,
        );
        store
            .put(
                &thread("thread-H"),
                None,
                &interrupted,
                &CheckpointMetadata::for_step(CheckpointSource::Loop, 1, LoopNode::Agent, 2),
            )
            .await
            .expect("put");
        let writes = [
            ChannelWrite::new(MESSAGES_CHANNEL, serde_json::to_value(Message::tool_result(&lookup, "found")).expect("encode")),
            ChannelWrite::new(MESSAGES_CHANNEL, json!({"content": "no discriminant"})),
        ];
        store.put_writes(&thread("thread-H"), &interrupted.id, &writes, "call_lookup").await.expect("writes");

        let history = runner.history("thread-H").await.expect("history");

        let kinds: Vec<&str> = history.iter().map(|message| message.kind.as_str()).collect();
        assert_eq!(kinds, vec!["human", "ai", "tool"]);
        assert_eq!(history[2].content, json!("found"));
    }

    #[test]
    fn plain_json_messages_normalize_by_type_then_id_path() {
        let typed = normalize_value(&json!({"type": "ai", "content": "hi", "tool_calls": [{"id": "c1"}]}))
            .expect("typed");
        assert_eq!(typed.kind, "ai");
        assert_eq!(typed.tool_calls.len(), 1);

        let serialized = normalize_value(&json!({
            "lc": 1,
            "type": "constructor",
            "id": ["langchain_core", "messages", "HumanMessage"],
            "kwargs": { "content": "hello" }
        }))
        .expect("id path");
        assert_eq!(serialized.kind, "human");
        assert_eq!(serialized.content, json!("hello"));
        assert!(serialized.tool_outputs.is_empty());

        assert!(normalize_value(&json!({"content": "no discriminant"})).is_none());
    }
}
