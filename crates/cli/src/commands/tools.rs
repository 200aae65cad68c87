use serde_json::Value;

use crate::commands::session::{self, Failure, Session};
use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let session = Session::open(&config).await?;
            let report = session.registry.probe().await;
            session.close().await;
            Ok::<_, Failure>(report)
        })
    });

    match result {
        Ok(report) => {
            let message = format!(
                "{} server(s) connected, {} failed, {} tool(s) available",
                report.connected.len(),
                report.failed.len(),
                report.tools.len()
            );
            let data = serde_json::to_value(&report).unwrap_or(Value::Null);
            CommandResult::success_with_data("tools", message, data)
        }
        Err(failure) => failure.into_result("tools"),
    }
}
