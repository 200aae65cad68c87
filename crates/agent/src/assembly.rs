//! Wiring of the agent runtime over a migrated database pool.

use std::sync::Arc;

use steward_core::config::AppConfig;
use steward_core::domain::tool::{BackendConnector, ChainedToolServers, StaticToolServers, ToolSet};
use steward_db::{DbPool, SqlCheckpointStore, SqlSettingsRepository, SqlToolServerRepository};

use crate::graph::AgentGraph;
use crate::llm::{ModelBuilder, ModelFactory};
use crate::runtime::Runner;
use crate::tools::{RegistryTimeouts, ToolFederationRegistry};

/// The runner together with the registry it federates tools through. The registry owns the
/// tool server connections and must be closed by the host.
pub struct AgentRuntime {
    pub runner: Arc<Runner>,
    pub registry: Arc<ToolFederationRegistry>,
}

impl AgentRuntime {
    /// Config-file servers are listed before database ones, so a database row cannot shadow a
    /// configured server of the same name. Settings, tool servers and checkpoints all live in
    /// `pool`, which must already be migrated.
    pub fn assemble(
        config: &AppConfig,
        pool: &DbPool,
        connector: Arc<dyn BackendConnector>,
        tool_sets: Vec<ToolSet>,
        model_builder: Arc<dyn ModelBuilder>,
    ) -> Self {
        let tool_servers = ChainedToolServers::new(vec![
            Arc::new(StaticToolServers::new(config.tool_servers.clone())),
            Arc::new(SqlToolServerRepository::new(pool.clone())),
        ]);
        let registry = Arc::new(ToolFederationRegistry::new(
            Arc::new(tool_servers),
            connector,
            tool_sets,
            RegistryTimeouts::from_config(&config.agent),
        ));
        let models = Arc::new(ModelFactory::new(
            Arc::new(SqlSettingsRepository::new(pool.clone())),
            config.llm.clone(),
            model_builder,
        ));
        let graph = AgentGraph::new(
            models,
            Arc::clone(&registry),
            config.agent.system_prompt.clone(),
            config.agent.max_steps,
        );
        let runner = Arc::new(Runner::new(graph, Arc::new(SqlCheckpointStore::new(pool.clone()))));

        Self { runner, registry }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use steward_core::config::AppConfig;
    use steward_core::domain::tool::ToolSet;
    use steward_db::{connect_with_settings, migrations};

    use super::AgentRuntime;
    use crate::graph::test_support::{EchoTool, NoServers, ScriptedModel, SharedModel};

    #[tokio::test]
    async fn assembled_runtime_persists_turns_in_the_pool() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");

        let runtime = AgentRuntime::assemble(
            &AppConfig::default(),
            &pool,
            Arc::new(NoServers),
            vec![ToolSet::new("local", vec![Arc::new(EchoTool)])],
            Arc::new(SharedModel(Arc::new(ScriptedModel::default()))),
        );

        let tools: Vec<String> =
            runtime.registry.list_tools().await.into_iter().map(|tool| tool.name).collect();
        assert_eq!(tools, vec!["echo".to_string()]);

        let output = runtime.runner.invoke("ping", "assembled").await.expect("invoke");
        assert_eq!(output.messages.last().map(|message| message.content.clone()), Some(json!("Echo: ping")));

        let checkpoints = runtime.runner.checkpoints("assembled").await.expect("checkpoints");
        assert_eq!(checkpoints.len(), 1);
        runtime.registry.close_all().await;
        pool.close().await;
    }
}
