pub mod credentials;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use dog_transfer::{S3CompatibleStore, TransferConfig, TransferOrchestrator, TransferReport};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use settings::store_config;

/// Resolve credentials, connect and run the workflow once.
///
/// Returns `None` when no credentials are configured; nothing is run then.
pub async fn run(cancel: &CancellationToken) -> Result<Option<TransferReport>> {
    let Some(credentials) = credentials::from_env()? else {
        info!(
            "Either the {} or {} environment variable is not set, and {} is empty",
            credentials::ACCOUNT_VAR,
            credentials::ACCESS_KEY_VAR,
            credentials::SECRET_FILE_VAR
        );
        return Ok(None);
    };

    let store = S3CompatibleStore::connect(store_config(), credentials).await?;
    let config = TransferConfig::from_env()?;

    let report = TransferOrchestrator::new(Arc::new(store), config)
        .run_default(cancel)
        .await;
    Ok(Some(report))
}
