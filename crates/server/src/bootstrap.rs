use std::sync::Arc;
use std::time::Duration;

use steward_agent::{
    AgentError, AgentRuntime, HttpModelBuilder, ModelBuilder, Runner, ToolFederationRegistry,
};
use steward_core::config::AppConfig;
use steward_core::domain::tool::ToolSet;
use steward_db::{connect_with_settings, migrations, DbPool};
use steward_mcp::McpStdioConnector;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runner: Arc<Runner>,
    pub registry: Arc<ToolFederationRegistry>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("agent runtime setup failed: {0}")]
    Agent(#[from] AgentError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let builder = Arc::new(HttpModelBuilder::new()?);
    bootstrap_with_parts(config, Vec::new(), builder).await
}

/// Wires config, storage, tool federation and the runner. In-process tool sets and the model
/// builder come from the host.
pub async fn bootstrap_with_parts(
    config: AppConfig,
    tool_sets: Vec<ToolSet>,
    model_builder: Arc<dyn ModelBuilder>,
) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let AgentRuntime { runner, registry } = AgentRuntime::assemble(
        &config,
        &db_pool,
        Arc::new(McpStdioConnector::new(Duration::from_secs(config.agent.connect_timeout_secs))),
        tool_sets,
        model_builder,
    );

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        static_tool_servers = config.tool_servers.len(),
        "agent runtime assembled"
    );
    Ok(Application { config, db_pool, runner, registry })
}
