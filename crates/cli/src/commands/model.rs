use std::sync::Arc;

use serde_json::Value;
use steward_agent::{HttpModelBuilder, ModelFactory};
use steward_db::SqlSettingsRepository;

use crate::commands::session::{self, Failure, EXIT_CONFIG};
use crate::commands::CommandResult;

/// Sends one message to the configured model without tools and reports the reply.
pub fn test(text: &str) -> CommandResult {
    if text.trim().is_empty() {
        return CommandResult::failure("model-test", "invalid_input", "message text must not be blank", EXIT_CONFIG);
    }

    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let builder = HttpModelBuilder::new()?;
            let pool = session::open_migrated(&config).await?;
            let factory = ModelFactory::new(
                Arc::new(SqlSettingsRepository::new(pool.clone())),
                config.llm.clone(),
                Arc::new(builder),
            );
            let probe = factory.probe(text).await;
            pool.close().await;
            Ok::<_, Failure>(probe?)
        })
    });

    match result {
        Ok(probe) => {
            let message = format!("{} model `{}` replied", probe.provider, probe.model);
            let data = serde_json::to_value(&probe).unwrap_or(Value::Null);
            CommandResult::success_with_data("model-test", message, data)
        }
        Err(failure) => failure.into_result("model-test"),
    }
}
