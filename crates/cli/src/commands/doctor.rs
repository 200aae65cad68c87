use std::sync::Arc;

use serde::Serialize;
use steward_agent::{HttpModelBuilder, ModelFactory};
use steward_core::config::{AppConfig, LoadOptions};
use steward_db::{connect_from_config, DbPool, SqlSettingsRepository};

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: format!(
                    "configuration loaded and validated ({} static tool server(s))",
                    config.tool_servers.len()
                ),
            });
            checks.extend(runtime_checks(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck::skipped(
                "database_connectivity",
                "configuration did not load",
            ));
            checks.push(DoctorCheck::skipped("model_credentials", "configuration did not load"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn runtime_checks(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                },
                DoctorCheck::skipped("model_credentials", "the async runtime did not start"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck::skipped("model_credentials", "the database is unreachable"),
                ];
            }
        };

        let checks = vec![
            DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            check_model_credentials(config, &pool).await,
        ];
        pool.close().await;
        checks
    })
}

/// Resolves the model the way a turn would, so stored settings are taken into account.
async fn check_model_credentials(config: &AppConfig, pool: &DbPool) -> DoctorCheck {
    let builder = match HttpModelBuilder::new() {
        Ok(builder) => builder,
        Err(error) => {
            return DoctorCheck {
                name: "model_credentials",
                status: CheckStatus::Fail,
                details: error.to_string(),
            };
        }
    };
    let factory = ModelFactory::new(
        Arc::new(SqlSettingsRepository::new(pool.clone())),
        config.llm.clone(),
        Arc::new(builder),
    );

    match factory.resolve().await {
        Ok(handle) => DoctorCheck {
            name: "model_credentials",
            status: CheckStatus::Pass,
            details: format!(
                "{} model `{}` is configured",
                handle.provider.as_str(),
                handle.model.model_name()
            ),
        },
        Err(error) => DoctorCheck {
            name: "model_credentials",
            status: CheckStatus::Fail,
            details: format!("{error} (run `steward migrate` if settings are unavailable)"),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
