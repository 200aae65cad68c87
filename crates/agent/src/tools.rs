//! Tool federation: one flat tool namespace over external tool servers and in-process tool
//! sets.
//!
//! Connections are opened lazily on first use and kept for the life of the registry. The
//! connection list and the name -> backend cache are copy-on-write snapshots, so listing and
//! dispatch never wait on a connect in progress; every mutation goes through one mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use steward_core::config::AgentConfig;
use steward_core::domain::tool::{
    BackendConnector, InProcessTool, RemoteConnection, ToolDescriptor, ToolServerSource, ToolSet,
};
use steward_core::errors::ToolError;

/// Where a tool name resolves to.
#[derive(Clone)]
pub enum ToolBackend {
    Local { set: String, handler: Arc<dyn InProcessTool> },
    Remote(Arc<dyn RemoteConnection>),
}

impl ToolBackend {
    pub fn label(&self) -> String {
        match self {
            Self::Local { set, .. } => format!("in-process:{set}"),
            Self::Remote(connection) => format!("server:{}", connection.server_name()),
        }
    }
}

impl std::fmt::Debug for ToolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RegistryTimeouts {
    pub connect: Duration,
    pub call: Duration,
}

impl RegistryTimeouts {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_timeout_secs),
            call: Duration::from_secs(config.tool_timeout_secs),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendFailure {
    pub server: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProbeReport {
    pub connected: Vec<String>,
    pub failed: Vec<BackendFailure>,
    pub tools: Vec<ToolDescriptor>,
}

pub struct ToolFederationRegistry {
    source: Arc<dyn ToolServerSource>,
    connector: Arc<dyn BackendConnector>,
    tool_sets: Vec<ToolSet>,
    timeouts: RegistryTimeouts,
    connections: RwLock<Arc<Vec<Arc<dyn RemoteConnection>>>>,
    failures: RwLock<Arc<Vec<BackendFailure>>>,
    cache: RwLock<Arc<HashMap<String, ToolBackend>>>,
    initialized: AtomicBool,
    generation: AtomicU64,
    mutation: Mutex<()>,
}

impl ToolFederationRegistry {
    pub fn new(
        source: Arc<dyn ToolServerSource>,
        connector: Arc<dyn BackendConnector>,
        tool_sets: Vec<ToolSet>,
        timeouts: RegistryTimeouts,
    ) -> Self {
        Self {
            source,
            connector,
            tool_sets,
            timeouts,
            connections: RwLock::default(),
            failures: RwLock::default(),
            cache: RwLock::default(),
            initialized: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            mutation: Mutex::new(()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Connects every enabled tool server once. Concurrent callers wait for the first one.
    /// A server that fails to connect is logged and left out; the registry still becomes
    /// initialized once every server was attempted.
    pub async fn ensure_initialized(&self) {
        if self.is_initialized() {
            return;
        }
        let _guard = self.mutation.lock().await;
        if self.is_initialized() {
            return;
        }

        let configs = match self.source.list_enabled().await {
            Ok(configs) => configs,
            Err(error) => {
                warn!(
                    event_name = "tools.source_unavailable",
                    error = %error,
                    "could not read tool server configuration, will retry on next use"
                );
                return;
            }
        };

        let mut connected: Vec<Arc<dyn RemoteConnection>> = Vec::with_capacity(configs.len());
        let mut failed = Vec::new();
        for config in &configs {
            let outcome =
                tokio::time::timeout(self.timeouts.connect, self.connector.connect(config)).await;
            let message = match outcome {
                Ok(Ok(connection)) => {
                    info!(
                        event_name = "tools.backend_connected",
                        server = %config.name,
                        "tool server connected"
                    );
                    connected.push(connection);
                    continue;
                }
                Ok(Err(error)) => error.to_string(),
                Err(_) => format!("connect timed out after {}s", self.timeouts.connect.as_secs()),
            };
            warn!(
                event_name = "tools.backend_skipped",
                server = %config.name,
                error = %message,
                "tool server failed to connect and is left out"
            );
            failed.push(BackendFailure { server: config.name.clone(), message });
        }

        info!(
            event_name = "tools.initialized",
            connected = connected.len(),
            failed = failed.len(),
            "tool federation initialized"
        );
        *self.connections.write().await = Arc::new(connected);
        *self.failures.write().await = Arc::new(failed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Lists every tool, external servers first in connection order, then in-process sets in
    /// registration order, and rebuilds the name cache. A name declared twice resolves to the
    /// later declaration.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.ensure_initialized().await;
        let generation = self.generation.load(Ordering::Acquire);
        let connections = self.connections.read().await.clone();

        let mut listed = Vec::new();
        let mut cache = HashMap::new();
        for connection in connections.iter() {
            match connection.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        register(&mut cache, &tool.name, ToolBackend::Remote(Arc::clone(connection)));
                        listed.push(tool);
                    }
                }
                Err(error) => warn!(
                    event_name = "tools.listing_failed",
                    server = connection.server_name(),
                    error = %error,
                    "tool server listing failed, its tools are left out"
                ),
            }
        }
        for set in &self.tool_sets {
            for handler in &set.tools {
                let tool = handler.descriptor();
                let backend =
                    ToolBackend::Local { set: set.name.clone(), handler: Arc::clone(handler) };
                register(&mut cache, &tool.name, backend);
                listed.push(tool);
            }
        }

        let _guard = self.mutation.lock().await;
        if self.generation.load(Ordering::Acquire) == generation {
            *self.cache.write().await = Arc::new(cache);
        }
        debug!(event_name = "tools.listed", tool_count = listed.len(), "federated tools listed");
        listed
    }

    /// Resolves `name`, refreshing the listing once on a miss, and returns the backend's raw
    /// result. Remote calls are bounded by the call timeout.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        self.ensure_initialized().await;
        let backend = match self.lookup(name).await {
            Some(backend) => backend,
            None => {
                self.list_tools().await;
                self.lookup(name).await.ok_or_else(|| ToolError::NotFound(name.to_string()))?
            }
        };

        debug!(event_name = "tools.dispatch", tool = name, backend = %backend.label(), "dispatching tool call");
        match backend {
            ToolBackend::Local { handler, .. } => handler.call(args).await,
            ToolBackend::Remote(connection) => {
                tokio::time::timeout(self.timeouts.call, connection.call_tool(name, args))
                    .await
                    .map_err(|_| ToolError::Timeout {
                        tool: name.to_string(),
                        secs: self.timeouts.call.as_secs(),
                    })?
            }
        }
    }

    /// Closes every connection and forgets all cached state; the next use reconnects.
    pub async fn close_all(&self) {
        let _guard = self.mutation.lock().await;
        let connections = std::mem::take(&mut *self.connections.write().await);
        for connection in connections.iter() {
            connection.close().await;
        }
        *self.cache.write().await = Arc::default();
        *self.failures.write().await = Arc::default();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.initialized.store(false, Ordering::Release);
        info!(event_name = "tools.closed", closed = connections.len(), "tool federation closed");
    }

    pub async fn probe(&self) -> ProbeReport {
        let tools = self.list_tools().await;
        let connected = self
            .connections
            .read()
            .await
            .iter()
            .map(|connection| connection.server_name().to_string())
            .collect();
        let failed = self.failures.read().await.as_ref().clone();
        ProbeReport { connected, failed, tools }
    }

    async fn lookup(&self, name: &str) -> Option<ToolBackend> {
        self.cache.read().await.get(name).cloned()
    }
}

fn register(cache: &mut HashMap<String, ToolBackend>, name: &str, backend: ToolBackend) {
    let winner = backend.label();
    if let Some(replaced) = cache.insert(name.to_string(), backend) {
        warn!(
            event_name = "tools.name_collision",
            tool = name,
            replaced = %replaced.label(),
            winner = %winner,
            "tool name declared by two backends, the later declaration wins"
        );
    }
}
