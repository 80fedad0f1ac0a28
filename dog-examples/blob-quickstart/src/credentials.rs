use std::path::Path;

use anyhow::{Context, Result};
use dog_transfer::Credentials;
use serde::Deserialize;
use tracing::info;

pub const ACCOUNT_VAR: &str = "STORAGE_ACCOUNT";
pub const ACCESS_KEY_VAR: &str = "STORAGE_ACCESS_KEY";
pub const SECRET_FILE_VAR: &str = "STORAGE_SECRET_FILE";

/// Layout of the JSON secret file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretFile {
    storage_account: String,
    storage_access_key: String,
}

/// Resolve credentials from the process environment
pub fn from_env() -> Result<Option<Credentials>> {
    resolve(|key| std::env::var(key).ok())
}

/// Environment pair first, then the secret file; `None` when neither is configured
pub fn resolve<F>(var: F) -> Result<Option<Credentials>>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| var(key).filter(|value| !value.trim().is_empty());

    if let (Some(account), Some(key)) = (non_empty(ACCOUNT_VAR), non_empty(ACCESS_KEY_VAR)) {
        info!("Using credentials from {} / {}", ACCOUNT_VAR, ACCESS_KEY_VAR);
        return Ok(Some(Credentials::new(account, key)?));
    }

    match non_empty(SECRET_FILE_VAR) {
        Some(path) => read_secret_file(Path::new(&path)).map(Some),
        None => Ok(None),
    }
}

fn read_secret_file(path: &Path) -> Result<Credentials> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Not able to read the secret file {}", path.display()))?;
    let secret: SecretFile = serde_json::from_str(&raw)
        .with_context(|| format!("Not able to parse the secret file {}", path.display()))?;
    info!(path = %path.display(), "Using credentials from secret file");
    Ok(Credentials::new(secret.storage_account, secret.storage_access_key)?)
}
