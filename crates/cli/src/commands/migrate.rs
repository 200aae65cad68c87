use crate::commands::session::{self, Failure};
use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let result = session::load_config().and_then(|config| {
        session::block_on(async move {
            let pool = session::open_migrated(&config).await?;
            pool.close().await;
            Ok::<_, Failure>(())
        })
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(failure) => failure.into_result("migrate"),
    }
}
