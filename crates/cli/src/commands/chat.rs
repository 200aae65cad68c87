use serde_json::json;
use steward_core::domain::message::MessageKind;

use crate::commands::session::{self, Failure, Session, EXIT_CONFIG};
use crate::commands::CommandResult;

pub fn run(thread_id: &str, text: &str) -> CommandResult {
    if thread_id.trim().is_empty() || text.trim().is_empty() {
        return CommandResult::failure(
            "chat",
            "invalid_input",
            "thread id and message text must not be empty",
            EXIT_CONFIG,
        );
    }

    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let session = Session::open(&config).await?;
            let output = session.runner.invoke(text, thread_id).await.map_err(Failure::from);
            session.close().await;
            output
        })
    });

    match result {
        Ok(output) => {
            let reply = output
                .messages
                .iter()
                .rev()
                .find(|message| message.kind == MessageKind::Ai.as_str())
                .map(|message| match message.content.as_str() {
                    Some(text) => text.to_string(),
                    None => message.content.to_string(),
                })
                .unwrap_or_default();
            CommandResult::success_with_data(
                "chat",
                reply,
                json!({ "thread_id": thread_id, "messages": output.messages }),
            )
        }
        Err(failure) => failure.into_result("chat"),
    }
}
