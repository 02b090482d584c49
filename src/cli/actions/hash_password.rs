use crate::auth::clock::OsRandom;
use crate::auth::config::{PasswordHashCost, PasswordPolicy};
use crate::auth::credential::CredentialStore;
use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use std::io::BufRead;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Args {
    pub cost: PasswordHashCost,
    pub policy: PasswordPolicy,
}

/// Read one line from `reader` as a password. The line ending is dropped;
/// nothing else is trimmed.
fn read_password(reader: &mut impl BufRead) -> Result<SecretString> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        return Err(anyhow!("no password given on stdin"));
    }
    Ok(SecretString::from(password))
}

fn hash_from_reader(args: &Args, reader: &mut impl BufRead) -> Result<String> {
    let password = read_password(reader)?;
    let credentials = CredentialStore::new(args.cost, args.policy, Arc::new(OsRandom))?;
    credentials
        .check_policy(password.expose_secret())
        .map_err(|violation| anyhow!("password rejected: {violation}"))?;
    credentials.hash(password.expose_secret())
}

/// Execute the hash-password action.
/// # Errors
/// Returns an error if stdin is empty, the password fails the policy, or
/// hashing fails.
pub async fn execute(args: Args) -> Result<()> {
    let hash = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        hash_from_reader(&args, &mut stdin.lock())
    })
    .await
    .context("hashing task failed")??;
    println!("{hash}");
    Ok(())
}
