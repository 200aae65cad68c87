use serde_json::json;

use crate::commands::session::{self, Failure, Session};
use crate::commands::CommandResult;

/// Prints one thread's messages, or a summary of every thread.
pub fn run(thread_id: Option<&str>) -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let session = Session::open(&config).await?;
            let outcome = match thread_id {
                Some(thread_id) => session.runner.history(thread_id).await.map(|messages| {
                    (
                        format!("thread `{thread_id}` has {} message(s)", messages.len()),
                        json!({ "thread_id": thread_id, "messages": messages }),
                    )
                }),
                None => session.runner.threads().await.map(|threads| {
                    (format!("{} thread(s) stored", threads.len()), json!({ "threads": threads }))
                }),
            };
            session.close().await;
            outcome.map_err(Failure::from)
        })
    });

    match result {
        Ok((message, data)) => CommandResult::success_with_data("history", message, data),
        Err(failure) => failure.into_result("history"),
    }
}

pub fn forget(thread_id: &str) -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let session = Session::open(&config).await?;
            let outcome = session.runner.delete_thread(thread_id).await;
            session.close().await;
            outcome.map_err(Failure::from)
        })
    });

    match result {
        Ok(()) => CommandResult::success("forget", format!("deleted thread `{thread_id}`")),
        Err(failure) => failure.into_result("forget"),
    }
}
