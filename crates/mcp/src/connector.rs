use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{ClientCapabilities, Implementation, InitializeRequestParams, ProtocolVersion};
use rmcp::service::serve_client;
use rmcp::transport::child_process::TokioChildProcess;
use tokio::process::Command;
use tracing::info;

use steward_core::domain::tool::{BackendConnector, RemoteConnection, ToolServerConfig};
use steward_core::errors::ToolError;

use crate::{McpConnection, McpError, McpResult};

/// Spawns tool servers as child processes and speaks MCP over their stdio.
#[derive(Clone, Debug)]
pub struct McpStdioConnector {
    handshake_timeout: Duration,
}

impl McpStdioConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    pub async fn connect_stdio(&self, config: &ToolServerConfig) -> McpResult<McpConnection> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let (transport, _stderr) = TokioChildProcess::builder(command)
            .spawn()
            .map_err(|source| McpError::Spawn { server: config.name.clone(), source })?;

        let service = tokio::time::timeout(
            self.handshake_timeout,
            serve_client(client_init_params(), transport),
        )
        .await
        .map_err(|_| McpError::HandshakeTimeout {
            server: config.name.clone(),
            secs: self.handshake_timeout.as_secs(),
        })?
        .map_err(|error| McpError::Handshake {
            server: config.name.clone(),
            message: error.to_string(),
        })?;

        info!(
            event_name = "mcp.connected",
            server = %config.name,
            command = %config.command,
            "connected to tool server"
        );
        Ok(McpConnection::new(config.name.clone(), service))
    }
}

#[async_trait]
impl BackendConnector for McpStdioConnector {
    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> Result<Arc<dyn RemoteConnection>, ToolError> {
        let connection = self.connect_stdio(config).await?;
        Ok(Arc::new(connection))
    }
}

fn client_init_params() -> InitializeRequestParams {
    InitializeRequestParams {
        meta: None,
        protocol_version: ProtocolVersion::V_2024_11_05,
        capabilities: ClientCapabilities::default(),
        client_info: Implementation::from_build_env(),
    }
}
