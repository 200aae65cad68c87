use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, InitializeRequestParams, Tool};
use rmcp::service::{RoleClient, RunningService};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use steward_core::domain::tool::{RemoteConnection, ToolDescriptor};
use steward_core::errors::ToolError;

use crate::McpError;

type ClientService = RunningService<RoleClient, InitializeRequestParams>;

/// One live MCP session with an external tool server.
pub struct McpConnection {
    name: String,
    service: RwLock<Option<Arc<ClientService>>>,
}

impl McpConnection {
    pub(crate) fn new(name: String, service: ClientService) -> Self {
        Self { name, service: RwLock::new(Some(Arc::new(service))) }
    }

    async fn service(&self) -> Result<Arc<ClientService>, McpError> {
        self.service.read().await.clone().ok_or_else(|| McpError::Closed(self.name.clone()))
    }
}

#[async_trait]
impl RemoteConnection for McpConnection {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let service = self.service().await?;
        let tools = service.list_all_tools().await.map_err(|error| McpError::Protocol {
            server: self.name.clone(),
            message: format!("tools/list: {error}"),
        })?;

        debug!(
            event_name = "mcp.tools_listed",
            server = %self.name,
            tool_count = tools.len(),
            "listed tools from tool server"
        );
        Ok(tools.iter().map(descriptor_from_tool).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let service = self.service().await?;
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(ToolError::execution(
                    name,
                    format!("arguments must be a JSON object, got {other}"),
                ))
            }
        };

        let result = service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_string().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|error| ToolError::execution(name, format!("tools/call: {error}")))?;

        if result.is_error == Some(true) {
            warn!(
                event_name = "mcp.tool_reported_error",
                server = %self.name,
                tool = name,
                "tool server flagged the call result as an error"
            );
        }

        serde_json::to_value(&result)
            .map_err(|error| ToolError::execution(name, format!("undecodable result: {error}")))
    }

    async fn close(&self) {
        let Some(service) = self.service.write().await.take() else {
            return;
        };
        match Arc::try_unwrap(service) {
            Ok(service) => {
                if let Err(error) = service.cancel().await {
                    warn!(
                        event_name = "mcp.close_failed",
                        server = %self.name,
                        error = %error,
                        "tool server did not shut down cleanly"
                    );
                }
            }
            // In-flight calls still hold the service; it shuts down when the last one drops.
            Err(_shared) => {}
        }
        debug!(event_name = "mcp.closed", server = %self.name, "tool server connection closed");
    }
}

pub fn descriptor_from_tool(tool: &Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool.description.as_ref().map(|text| text.to_string()).unwrap_or_default(),
        input_schema: Value::Object(tool.input_schema.as_ref().clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rmcp::model::Tool;
    use serde_json::json;

    use super::descriptor_from_tool;

    #[test]
    fn descriptor_keeps_name_description_and_schema() {
        let schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        let schema = match schema {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("literal is an object"),
        };
        let tool = Tool::new("read_file", "Read a file from the shared drive", Arc::new(schema));

        let descriptor = descriptor_from_tool(&tool);
        assert_eq!(descriptor.name, "read_file");
        assert_eq!(descriptor.description, "Read a file from the shared drive");
        assert_eq!(descriptor.input_schema["required"], json!(["path"]));
    }
}
