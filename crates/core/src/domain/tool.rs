use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ApplicationError, ToolError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self { name: name.into(), description: description.into(), input_schema }
    }
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Launch configuration for one external tool server spoken to over stdio.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "enabled_by_default", alias = "enabled")]
    pub is_enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ToolServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            is_enabled: true,
        }
    }
}

/// A tool implemented in the host process, e.g. CRM lookups or knowledge search.
#[async_trait]
pub trait InProcessTool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

/// A live session with an external tool server.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError>;

    async fn close(&self);
}

#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> Result<Arc<dyn RemoteConnection>, ToolError>;
}

/// Where the registry learns which external tool servers to start.
#[async_trait]
pub trait ToolServerSource: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<ToolServerConfig>, ApplicationError>;
}

/// Tool servers declared in the config file.
#[derive(Clone, Debug, Default)]
pub struct StaticToolServers {
    servers: Vec<ToolServerConfig>,
}

impl StaticToolServers {
    pub fn new(servers: Vec<ToolServerConfig>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ToolServerSource for StaticToolServers {
    async fn list_enabled(&self) -> Result<Vec<ToolServerConfig>, ApplicationError> {
        Ok(self.servers.iter().filter(|server| server.is_enabled).cloned().collect())
    }
}

/// Reads several sources in order. A server whose name an earlier source already returned is
/// skipped.
#[derive(Clone, Default)]
pub struct ChainedToolServers {
    sources: Vec<Arc<dyn ToolServerSource>>,
}

impl ChainedToolServers {
    pub fn new(sources: Vec<Arc<dyn ToolServerSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl ToolServerSource for ChainedToolServers {
    async fn list_enabled(&self) -> Result<Vec<ToolServerConfig>, ApplicationError> {
        let mut seen = std::collections::HashSet::new();
        let mut servers = Vec::new();
        for source in &self.sources {
            for server in source.list_enabled().await? {
                if seen.insert(server.name.clone()) {
                    servers.push(server);
                }
            }
        }
        Ok(servers)
    }
}

/// A named group of in-process tools registered with the federation registry.
#[derive(Clone)]
pub struct ToolSet {
    pub name: String,
    pub tools: Vec<Arc<dyn InProcessTool>>,
}

impl ToolSet {
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn InProcessTool>>) -> Self {
        Self { name: name.into(), tools }
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.tools.iter().map(|tool| tool.descriptor().name).collect();
        f.debug_struct("ToolSet").field("name", &self.name).field("tools", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ChainedToolServers, StaticToolServers, ToolServerConfig, ToolServerSource};

    #[tokio::test]
    async fn static_source_skips_disabled_servers() {
        let mut disabled = ToolServerConfig::new("legacy", "legacy-mcp");
        disabled.is_enabled = false;
        let source =
            StaticToolServers::new(vec![ToolServerConfig::new("files", "mcp-files"), disabled]);

        let enabled = source.list_enabled().await.expect("list");
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "files");
    }

    #[tokio::test]
    async fn chained_sources_keep_the_first_server_of_a_name() {
        let file = StaticToolServers::new(vec![ToolServerConfig::new("files", "mcp-files")]);
        let database = StaticToolServers::new(vec![
            ToolServerConfig::new("files", "other-files"),
            ToolServerConfig::new("git", "mcp-git"),
        ]);
        let chained = ChainedToolServers::new(vec![Arc::new(file), Arc::new(database)]);

        let servers = chained.list_enabled().await.expect("list");
        let commands: Vec<&str> = servers.iter().map(|server| server.command.as_str()).collect();
        assert_eq!(commands, vec!["mcp-files", "mcp-git"]);
    }

    #[test]
    fn config_accepts_enabled_alias() {
        let config: ToolServerConfig = toml::from_str(
            r#"
name = "files"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem"]
enabled = false
"#,
        )
        .expect("parse");
        assert!(!config.is_enabled);
        assert_eq!(config.args.len(), 2);
    }
}
