pub mod config;
pub mod domain;
pub mod errors;
pub mod settings;

pub use config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
pub use domain::checkpoint::{
    ChannelWrite, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef, CheckpointSource,
    CheckpointTuple, ConversationState, LoopNode, PendingWrite, ThreadId,
};
pub use domain::message::{Message, MessageKind, ToolCall, ToolCallId, ToolStatus};
pub use domain::tool::{
    BackendConnector, ChainedToolServers, InProcessTool, RemoteConnection, StaticToolServers,
    ToolDescriptor, ToolServerConfig, ToolServerSource, ToolSet,
};
pub use errors::{ApplicationError, DomainError, InterfaceError, ToolError};
pub use settings::{InMemorySettings, SettingsProvider};
