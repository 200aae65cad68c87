//! Steward MCP (Model Context Protocol) client
//!
//! Connects to external tool servers over stdio and exposes them to the
//! agent's tool federation registry as [`RemoteConnection`]s.
//!
//! ## Architecture
//!
//! - `McpStdioConnector`: spawns the configured command and runs the MCP handshake
//! - `McpConnection`: one live session; lists tools and forwards calls
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use steward_core::domain::tool::{BackendConnector, RemoteConnection, ToolServerConfig};
//! use steward_mcp::McpStdioConnector;
//!
//! # async fn demo() -> Result<(), steward_core::ToolError> {
//! let connector = McpStdioConnector::new(Duration::from_secs(20));
//! let connection = connector.connect(&ToolServerConfig::new("files", "mcp-files")).await?;
//! let _tools = connection.list_tools().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`RemoteConnection`]: steward_core::domain::tool::RemoteConnection

mod connection;
mod connector;

pub use connection::{descriptor_from_tool, McpConnection};
pub use connector::McpStdioConnector;

use steward_core::errors::ToolError;
use thiserror::Error;

/// Errors specific to MCP client operations
#[derive(Error, Debug)]
pub enum McpError {
    #[error("could not spawn tool server `{server}`: {source}")]
    Spawn { server: String, source: std::io::Error },

    #[error("handshake with tool server `{server}` failed: {message}")]
    Handshake { server: String, message: String },

    #[error("handshake with tool server `{server}` timed out after {secs}s")]
    HandshakeTimeout { server: String, secs: u64 },

    #[error("tool server `{server}` protocol error: {message}")]
    Protocol { server: String, message: String },

    #[error("tool server `{0}` connection is closed")]
    Closed(String),
}

impl McpError {
    /// JSON-RPC error code used when surfacing the failure to callers
    pub fn error_code(&self) -> i32 {
        match self {
            McpError::Protocol { .. } => -32603,
            McpError::Spawn { .. } | McpError::Handshake { .. } => -32000,
            McpError::HandshakeTimeout { .. } | McpError::Closed(_) => -32001,
        }
    }

    fn server(&self) -> &str {
        match self {
            McpError::Spawn { server, .. }
            | McpError::Handshake { server, .. }
            | McpError::HandshakeTimeout { server, .. }
            | McpError::Protocol { server, .. } => server,
            McpError::Closed(server) => server,
        }
    }
}

impl From<McpError> for ToolError {
    fn from(value: McpError) -> Self {
        ToolError::connection(value.server().to_string(), value.to_string())
    }
}

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use steward_core::errors::ToolError;

    use super::McpError;

    #[test]
    fn errors_map_to_connection_failures_naming_the_server() {
        let error = McpError::HandshakeTimeout { server: "files".into(), secs: 20 };
        assert_eq!(error.error_code(), -32001);

        let tool_error = ToolError::from(error);
        assert!(matches!(
            tool_error,
            ToolError::Connection { ref server, ref message }
                if server == "files" && message.contains("timed out after 20s")
        ));
    }
}
