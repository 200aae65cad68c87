//! Agent Runtime - the reasoning loop behind every conversation turn
//!
//! This crate provides the execution core of steward:
//! - Resolves the chat model from runtime settings on every step
//! - Federates tools from external tool servers and in-process tool sets
//! - Alternates model and tool steps until the model answers in plain text
//! - Commits a checkpoint after every step so interrupted turns can resume
//!
//! # Architecture
//!
//! A turn is a loop over [`LoopNode`](steward_core::LoopNode):
//! 1. **Agent** (`graph`) - bind the federated tools and ask the model for the next message
//! 2. **Tools** (`graph`, `tools`) - run every requested call concurrently, results in call order
//! 3. **Checkpoint** (`runtime`) - persist the state and the node to run next
//!
//! # Key Types
//!
//! - `Runner` - per-thread entry point (see `runtime` module)
//! - `AgentRuntime` - the runner and registry wired over one database pool
//! - `ModelFactory` - settings-driven OpenAI/Anthropic model resolution
//! - `ToolFederationRegistry` - one flat tool namespace over every backend
//!
//! # Failure Principle
//!
//! Tool failures are data: they come back to the model as error-status tool messages.
//! Model misconfiguration and persistence failures end the turn.

pub mod assembly;
pub mod error;
pub mod graph;
pub mod llm;
pub mod runtime;
pub mod tools;

pub use assembly::AgentRuntime;
pub use error::AgentError;
pub use graph::{AgentGraph, StepSink};
pub use llm::{
    bind_tools, to_provider_tools, BoundModel, ChatModel, HttpModelBuilder, ModelBuilder,
    ModelFactory, ModelHandle, ModelProbe, ModelSpec,
};
pub use runtime::{normalize_value, InvokeOutput, NormalizedMessage, Runner};
pub use tools::{BackendFailure, ProbeReport, RegistryTimeouts, ToolBackend, ToolFederationRegistry};
