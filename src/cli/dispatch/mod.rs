use crate::cli::actions::{Action, server::Args};
use anyhow::Result;

/// Turn parsed arguments into an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(9710);

    Ok(Action::Server(Args { port }))
}
