//! Per-command composition of the agent runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use steward_agent::{AgentError, AgentRuntime, HttpModelBuilder, Runner, ToolFederationRegistry};
use steward_core::config::{AppConfig, LoadOptions};
use steward_db::{connect_from_config, migrations, DbPool, RepositoryError};
use steward_mcp::McpStdioConnector;

use crate::commands::CommandResult;

pub const EXIT_NOT_FOUND: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME_INIT: u8 = 3;
pub const EXIT_DB_CONNECT: u8 = 4;
pub const EXIT_MIGRATION: u8 = 5;
pub const EXIT_AGENT: u8 = 6;

/// A failed command step, rendered as a JSON outcome.
#[derive(Debug)]
pub struct Failure {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl Failure {
    pub fn new(error_class: &'static str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { error_class, message: message.into(), exit_code }
    }

    pub fn into_result(self, command: &str) -> CommandResult {
        CommandResult::failure(command, self.error_class, self.message, self.exit_code)
    }
}

impl From<AgentError> for Failure {
    fn from(value: AgentError) -> Self {
        Failure::new("agent", value.to_string(), EXIT_AGENT)
    }
}

impl From<RepositoryError> for Failure {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Invariant(message) => Failure::new("invalid_input", message, EXIT_CONFIG),
            other => Failure::new("persistence", other.to_string(), EXIT_DB_CONNECT),
        }
    }
}

pub fn load_config() -> Result<AppConfig, Failure> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        Failure::new("config_validation", format!("configuration issue: {error}"), EXIT_CONFIG)
    })
}

/// Runs one command body on a fresh current-thread runtime.
pub fn block_on<T>(work: impl Future<Output = Result<T, Failure>>) -> Result<T, Failure> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(
        |error| {
            Failure::new(
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME_INIT,
            )
        },
    )?;
    runtime.block_on(work)
}

pub async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    connect_from_config(&config.database)
        .await
        .map_err(|error| Failure::new("db_connectivity", error.to_string(), EXIT_DB_CONNECT))
}

/// Connects and applies pending migrations.
pub async fn open_migrated(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = open_pool(config).await?;
    if let Err(error) = migrations::run_pending(&pool).await {
        pool.close().await;
        return Err(Failure::new("migration", error.to_string(), EXIT_MIGRATION));
    }
    Ok(pool)
}

pub struct Session {
    pub pool: DbPool,
    pub runner: Arc<Runner>,
    pub registry: Arc<ToolFederationRegistry>,
}

impl Session {
    /// Connects, applies migrations and assembles the runner with no in-process tools.
    pub async fn open(config: &AppConfig) -> Result<Self, Failure> {
        let model_builder = HttpModelBuilder::new()?;
        let pool = open_migrated(config).await?;
        let AgentRuntime { runner, registry } = AgentRuntime::assemble(
            config,
            &pool,
            Arc::new(McpStdioConnector::new(Duration::from_secs(config.agent.connect_timeout_secs))),
            Vec::new(),
            Arc::new(model_builder),
        );

        Ok(Self { pool, runner, registry })
    }

    pub async fn close(self) {
        self.registry.close_all().await;
        self.pool.close().await;
    }
}
