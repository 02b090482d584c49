use crate::cli::actions::{Action, hash_password, sweep};
use anyhow::Result;

/// Single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Sweep(args) => sweep::execute(args).await,
        Action::HashPassword(args) => hash_password::execute(args).await,
    }
}
