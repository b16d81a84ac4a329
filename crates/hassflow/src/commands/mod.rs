//! Command dispatch: bridges CLI args -> runtime calls -> output formatting.

pub mod call;
pub mod check;
pub mod config_cmd;
pub mod get;
pub mod states;
pub mod watch;

use std::future::Future;
use std::time::Duration;

use crate::cli::{Command, GlobalOpts};
use crate::config::Resolved;
use crate::error::CliError;

/// Dispatch an instance-bound command to the appropriate handler.
pub async fn dispatch(
    cmd: Command,
    resolved: Resolved,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Check => check::handle(&resolved, global).await,
        Command::States(args) => states::handle(resolved, args, global).await,
        Command::Get(args) => get::handle(resolved, args, global).await,
        Command::Watch(args) => watch::handle(resolved, args, global).await,
        Command::Call(args) => call::handle(resolved, args, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "command does not need an instance connection".into(),
        )),
    }
}

/// Bound `fut` by `limit`, reporting the limit in whole seconds.
pub(crate) async fn within<T, F>(limit: Duration, fut: F) -> Result<T, CliError>
where
    F: Future<Output = Result<T, CliError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| {
            Err(CliError::Timeout {
                seconds: limit.as_secs(),
            })
        })
}
