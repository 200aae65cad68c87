//! Tool servers stored in the database. Config-file servers are listed but read-only.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use steward_core::domain::tool::ToolServerConfig;
use steward_db::repositories::{ToolServerPatch, ToolServerRecord};
use steward_db::{DbPool, SqlToolServerRepository};

use crate::commands::session::{self, Failure, EXIT_CONFIG, EXIT_NOT_FOUND};
use crate::commands::CommandResult;

pub fn list() -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let pool = session::open_migrated(&config).await?;
            let stored = SqlToolServerRepository::new(pool.clone()).list().await;
            pool.close().await;

            let mut servers: Vec<Value> =
                config.tool_servers.iter().map(|server| server_view(None, server, "config")).collect();
            servers.extend(stored?.iter().map(|record| server_view(Some(record), &record.config, "database")));
            Ok::<_, Failure>(servers)
        })
    });

    match result {
        Ok(servers) => CommandResult::success_with_data(
            "servers",
            format!("{} tool server(s) registered", servers.len()),
            json!({ "servers": servers }),
        ),
        Err(failure) => failure.into_result("servers"),
    }
}

/// Registers a stdio tool server; `env` entries are `KEY=VALUE` pairs.
pub fn add(name: &str, command: &str, args: &[String], env: &[String], enabled: bool) -> CommandResult {
    let result = parse_env(env).and_then(|env| {
        let config = ToolServerConfig {
            name: name.trim().to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            env,
            is_enabled: enabled,
        };
        session::load_config().and_then(|app| {
            session::block_on(async move {
                if app.tool_servers.iter().any(|server| server.name == config.name) {
                    return Err(Failure::new(
                        "invalid_input",
                        format!("tool server `{}` is already defined in the config file", config.name),
                        EXIT_CONFIG,
                    ));
                }
                let pool = session::open_migrated(&app).await?;
                let added = SqlToolServerRepository::new(pool.clone()).add(config).await;
                pool.close().await;
                Ok::<_, Failure>(added?)
            })
        })
    });

    match result {
        Ok(record) => CommandResult::success_with_data(
            "servers",
            format!("added tool server `{}`", record.config.name),
            json!({ "server": server_view(Some(&record), &record.config, "database") }),
        ),
        Err(failure) => failure.into_result("servers"),
    }
}

/// Deletes a stored server, addressed by id or by name.
pub fn remove(target: &str) -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let pool = session::open_migrated(&config).await?;
            let outcome = remove_in(&pool, target).await;
            pool.close().await;
            outcome
        })
    });

    match result {
        Ok(record) => CommandResult::success("servers", format!("removed tool server `{}`", record.config.name)),
        Err(failure) => failure.into_result("servers"),
    }
}

pub fn set_enabled(target: &str, enabled: bool) -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let pool = session::open_migrated(&config).await?;
            let outcome = set_enabled_in(&pool, target, enabled).await;
            pool.close().await;
            outcome
        })
    });

    let verb = if enabled { "enabled" } else { "disabled" };
    match result {
        Ok(record) => CommandResult::success_with_data(
            "servers",
            format!("{verb} tool server `{}`", record.config.name),
            json!({ "server": server_view(Some(&record), &record.config, "database") }),
        ),
        Err(failure) => failure.into_result("servers"),
    }
}

async fn remove_in(pool: &DbPool, target: &str) -> Result<ToolServerRecord, Failure> {
    let repository = SqlToolServerRepository::new(pool.clone());
    let record = find_stored(&repository, target).await?;
    if !repository.delete(&record.id).await? {
        return Err(not_found(target));
    }
    Ok(record)
}

async fn set_enabled_in(pool: &DbPool, target: &str, enabled: bool) -> Result<ToolServerRecord, Failure> {
    let repository = SqlToolServerRepository::new(pool.clone());
    let record = find_stored(&repository, target).await?;
    let patch = ToolServerPatch { is_enabled: Some(enabled), ..ToolServerPatch::default() };
    repository.update(&record.id, patch).await?.ok_or_else(|| not_found(target))
}

async fn find_stored(
    repository: &SqlToolServerRepository,
    target: &str,
) -> Result<ToolServerRecord, Failure> {
    repository
        .list()
        .await?
        .into_iter()
        .find(|record| record.id.0 == target || record.config.name == target)
        .ok_or_else(|| not_found(target))
}

fn not_found(target: &str) -> Failure {
    Failure::new("not_found", format!("no stored tool server matches `{target}`"), EXIT_NOT_FOUND)
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>, Failure> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
            _ => Err(Failure::new(
                "invalid_input",
                format!("environment entry `{pair}` must look like KEY=VALUE"),
                EXIT_CONFIG,
            )),
        })
        .collect()
}

/// Environment values can carry credentials, so only their keys are shown.
fn server_view(record: Option<&ToolServerRecord>, config: &ToolServerConfig, source: &str) -> Value {
    json!({
        "id": record.map(|record| record.id.0.clone()),
        "name": config.name,
        "command": config.command,
        "args": config.args,
        "env_keys": config.env.keys().collect::<Vec<_>>(),
        "is_enabled": config.is_enabled,
        "source": source,
        "updated_at": record.map(|record| record.updated_at.to_rfc3339()),
    })
}
