use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    BlobName, BlobPager, ContainerName, FileSource, ObjectStore, ParallelUploader, RetryingDownloader,
    ScratchFile, StoreErrorKind, TransferConfig, TransferError, TransferResult, UploadReceipt,
};

/// Payload uploaded when the caller does not supply one
pub const DEFAULT_PAYLOAD: &[u8] = b"hello world this is a blob\n";

/// Supplies names for the container and blob of a run
pub trait NameGenerator: Send + Sync {
    fn container_name(&self) -> TransferResult<ContainerName>;
    fn blob_name(&self) -> TransferResult<BlobName>;
}

/// Random names: `<prefix>-<uuid>` containers and bare uuid blobs
#[derive(Debug, Clone)]
pub struct RandomNameGenerator {
    prefix: String,
}

impl RandomNameGenerator {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for RandomNameGenerator {
    fn default() -> Self {
        Self::new("quickstart")
    }
}

impl NameGenerator for RandomNameGenerator {
    fn container_name(&self) -> TransferResult<ContainerName> {
        ContainerName::new(format!("{}-{}", self.prefix, uuid::Uuid::new_v4().simple()))
    }

    fn blob_name(&self) -> TransferResult<BlobName> {
        BlobName::new(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// The same names on every call
#[derive(Debug, Clone)]
pub struct FixedNameGenerator {
    container: ContainerName,
    blob: BlobName,
}

impl FixedNameGenerator {
    pub fn new(container: ContainerName, blob: BlobName) -> Self {
        Self { container, blob }
    }
}

impl NameGenerator for FixedNameGenerator {
    fn container_name(&self) -> TransferResult<ContainerName> {
        Ok(self.container.clone())
    }

    fn blob_name(&self) -> TransferResult<BlobName> {
        Ok(self.blob.clone())
    }
}

/// Where a run currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Init,
    ContainerCreated,
    Uploaded,
    Listed,
    Downloaded,
    CleanedUp,
    Failed,
}

/// Append-only transcript of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLog {
    lines: Vec<String>,
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S: Into<String>>(&mut self, line: S) {
        let line = line.into();
        info!(target: "dog_transfer::transcript", "{}", line);
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// One line per entry, newline terminated
    pub fn render(&self) -> String {
        self.lines.iter().fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }
}

impl std::fmt::Display for TransferLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Outcome of a run: the transcript so far plus the first fatal error, if any
#[derive(Debug)]
pub struct TransferReport {
    pub log: TransferLog,
    pub state: TransferState,
    /// Every state entered after `Init`, in order
    pub transitions: Vec<TransferState>,
    pub error: Option<TransferError>,
    pub container: Option<ContainerName>,
    pub upload: Option<UploadReceipt>,
    pub listed: Vec<BlobName>,
    pub downloaded: Option<Bytes>,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> TransferResult<TransferLog> {
        match self.error {
            None => Ok(self.log),
            Some(err) => Err(err),
        }
    }
}

/// Resources a run has to give back whatever happens
#[derive(Default)]
struct Leases {
    container: Option<ContainerName>,
    scratch: Option<ScratchFile>,
}

/// Runs create → upload → list → download → cleanup against one store
pub struct TransferOrchestrator {
    store: Arc<dyn ObjectStore>,
    names: Arc<dyn NameGenerator>,
    config: TransferConfig,
}

impl TransferOrchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self {
            store,
            names: Arc::new(RandomNameGenerator::default()),
            config,
        }
    }

    pub fn with_names<N: NameGenerator + 'static>(mut self, names: N) -> Self {
        self.names = Arc::new(names);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Run the workflow with [`DEFAULT_PAYLOAD`]
    pub async fn run_default(&self, cancel: &CancellationToken) -> TransferReport {
        self.run(Bytes::from_static(DEFAULT_PAYLOAD), cancel).await
    }

    #[instrument(skip_all, fields(size = payload.len()))]
    pub async fn run(&self, payload: Bytes, cancel: &CancellationToken) -> TransferReport {
        let mut report = TransferReport {
            log: TransferLog::new(),
            state: TransferState::Init,
            transitions: Vec::new(),
            error: None,
            container: None,
            upload: None,
            listed: Vec::new(),
            downloaded: None,
        };
        let mut leases = Leases::default();

        report.log.push("Blob storage quick start sample");
        let outcome = self.drive(&mut report, &mut leases, payload, cancel).await;

        if let Err(err) = &outcome {
            warn!(state = ?report.state, %err, "Transfer failed");
            report.log.push(format!("Transfer failed: {}", err));
        }

        report.log.push("Cleaning up.");
        self.cleanup(&mut report.log, leases).await;

        match outcome {
            Ok(()) => self.advance(&mut report, TransferState::CleanedUp),
            Err(err) => {
                self.advance(&mut report, TransferState::Failed);
                report.error = Some(err);
            }
        }
        info!(state = ?report.state, "Transfer finished");
        report
    }

    async fn drive(
        &self,
        report: &mut TransferReport,
        leases: &mut Leases,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        self.config.validate()?;

        // Init → ContainerCreated
        ensure_active(cancel)?;
        let container = self.names.container_name()?;
        report.log.push(format!("Creating a container named {}", container));
        let created = self.store.create_container(&container).await.map_err(|err| match err.kind {
            StoreErrorKind::AlreadyExists => TransferError::ContainerExists {
                container: container.to_string(),
            },
            _ => err.into(),
        });
        match created {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                warn!(%err, "Continuing with the existing container");
                report.log.push(format!("Container {} already exists, continuing", container));
            }
            Err(err) => return Err(err),
        }
        leases.container = Some(container.clone());
        report.container = Some(container.clone());
        self.advance(report, TransferState::ContainerCreated);

        // ContainerCreated → Uploaded
        ensure_active(cancel)?;
        report.log.push("Creating a dummy file to test the upload and download");
        let blob = self.names.blob_name()?;
        let scratch = ScratchFile::create(&self.config.scratch_dir, blob.as_str(), &payload).await?;
        let scratch_path = scratch.path().to_path_buf();
        leases.scratch = Some(scratch);

        report.log.push(format!("Uploading the file with blob name: {}", blob));
        let receipt = {
            let source = FileSource::open(&scratch_path).await?;
            ParallelUploader::new(self.store.clone(), self.config.clone())
                .upload(&container, &blob, &source, cancel)
                .await?
        };
        report.upload = Some(receipt);
        self.advance(report, TransferState::Uploaded);

        // Uploaded → Listed
        report.log.push("Listing the blobs in the container:");
        let mut pager = BlobPager::new(self.store.clone(), container.clone(), self.config.page_size);
        loop {
            ensure_active(cancel)?;
            let Some(descriptor) = pager.next().await? else {
                break;
            };
            report.log.push(format!("\tBlob name: {}", descriptor.name));
            report.listed.push(descriptor.name);
        }
        self.advance(report, TransferState::Listed);

        // Listed → Downloaded
        ensure_active(cancel)?;
        let content = RetryingDownloader::new(
            self.store.clone(),
            self.config.read_retries,
            self.config.read_retry.clone(),
        )
        .open(&container, &blob, 0, None, cancel)
        .read_to_end()
        .await?;
        report.log.push(format!(
            "Downloaded the blob: {}",
            String::from_utf8_lossy(&content).trim_end_matches(['\r', '\n'])
        ));
        report.downloaded = Some(content);
        self.advance(report, TransferState::Downloaded);

        Ok(())
    }

    /// Best effort: failures are logged and never change the outcome
    async fn cleanup(&self, log: &mut TransferLog, leases: Leases) {
        if let Some(container) = leases.container {
            if let Err(err) = self.store.delete_container(&container).await {
                let err = TransferError::cleanup(format!("Deleting container {}: {}", container, err));
                warn!(%err, "Cleanup step failed");
                log.push(format!("Cleanup warning: {}", err));
            }
        }
        if let Some(scratch) = leases.scratch {
            if let Err(err) = scratch.remove().await {
                warn!(%err, "Cleanup step failed");
                log.push(format!("Cleanup warning: {}", err));
            }
        }
    }

    fn advance(&self, report: &mut TransferReport, next: TransferState) {
        info!(from = ?report.state, to = ?next, "Transfer state changed");
        report.transitions.push(next);
        report.state = next;
    }
}

fn ensure_active(cancel: &CancellationToken) -> TransferResult<()> {
    if cancel.is_cancelled() {
        Err(TransferError::Canceled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_renders_one_line_per_entry() {
        let mut log = TransferLog::new();
        log.push("first");
        log.push("\tsecond");
        assert_eq!(log.render(), "first\n\tsecond\n");
        assert_eq!(log.to_string(), log.render());
        assert_eq!(log.lines().len(), 2);
    }

    #[test]
    fn random_names_are_valid_and_distinct() {
        let names = RandomNameGenerator::default();
        let a = names.container_name().unwrap();
        let b = names.container_name().unwrap();
        assert!(a.as_str().starts_with("quickstart-"));
        assert_ne!(a, b);
        assert_ne!(names.blob_name().unwrap(), names.blob_name().unwrap());
    }

    #[test]
    fn report_into_result_carries_the_error() {
        let report = TransferReport {
            log: TransferLog::new(),
            state: TransferState::Failed,
            transitions: vec![TransferState::Failed],
            error: Some(TransferError::Canceled),
            container: None,
            upload: None,
            listed: Vec::new(),
            downloaded: None,
        };
        assert!(!report.is_success());
        assert!(matches!(report.into_result(), Err(TransferError::Canceled)));
    }
}
