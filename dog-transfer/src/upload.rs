use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::retry::with_retry;
use crate::{
    BlobName, BlockId, BlockSource, BlockStatus, ChunkPlanner, ContainerName, ObjectStore,
    TransferConfig, TransferError, TransferResult,
};

/// How an upload reached the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMethod {
    /// One direct write
    Single,
    /// Staged blocks followed by one commit
    Blocks { block_size: u64, block_count: u32 },
}

/// Receipt returned after a blob was committed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub blob: BlobName,
    pub size_bytes: u64,
    pub method: UploadMethod,
}

/// Uploads a source as staged blocks across a bounded worker pool, then
/// commits the block list once.
///
/// Sources no larger than `single_put_threshold` take a single `put_blob`
/// instead. A blob is never committed unless every block was acknowledged.
pub struct ParallelUploader {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
}

impl ParallelUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip_all, fields(container = %container, blob = %blob, size = source.len()))]
    pub async fn upload<S>(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        source: &S,
        cancel: &CancellationToken,
    ) -> TransferResult<UploadReceipt>
    where
        S: BlockSource + ?Sized,
    {
        self.config.validate()?;
        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }

        let size_bytes = source.len();
        if size_bytes <= self.config.single_put_threshold {
            let data = source.read_range(0..size_bytes).await?;
            with_retry(&self.config.block_retry, cancel, "put blob", || {
                self.store.put_blob(container, blob, data.clone())
            })
            .await?;
            info!(size_bytes, "Uploaded blob with a single put");
            return Ok(UploadReceipt {
                blob: blob.clone(),
                size_bytes,
                method: UploadMethod::Single,
            });
        }

        let capabilities = self.store.capabilities();
        let block_size = capabilities.effective_block_size(self.config.block_size);
        let planner = ChunkPlanner::new(size_bytes, block_size)?;
        if let Some(max_blocks) = capabilities.max_blocks {
            if planner.block_count() > u64::from(max_blocks) {
                return Err(TransferError::invalid(format!(
                    "{} blocks of {} bytes exceeds the store limit of {} blocks",
                    planner.block_count(),
                    block_size,
                    max_blocks
                )));
            }
        }

        let block_ids = match self.stage_blocks(container, blob, source, &planner, cancel).await {
            Ok(ids) => ids,
            Err(err) => {
                self.abort(container, blob).await;
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            self.abort(container, blob).await;
            return Err(TransferError::Canceled);
        }

        if let Err(err) = self.store.commit_blocks(container, blob, &block_ids).await {
            self.abort(container, blob).await;
            return Err(TransferError::commit(blob.as_str(), err.to_string()));
        }

        let block_count = block_ids.len() as u32;
        info!(block_count, block_size, "Committed block list");
        Ok(UploadReceipt {
            blob: blob.clone(),
            size_bytes,
            method: UploadMethod::Blocks {
                block_size,
                block_count,
            },
        })
    }

    /// Stage every planned block, returning the ids in chunk order
    async fn stage_blocks<S>(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        source: &S,
        planner: &ChunkPlanner,
        cancel: &CancellationToken,
    ) -> TransferResult<Vec<BlockId>>
    where
        S: BlockSource + ?Sized,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        // Cancelled by the caller, or by the first block that gives up
        let abort = cancel.child_token();
        let mut statuses = vec![BlockStatus::Pending; planner.block_count() as usize];
        let mut tasks = JoinSet::new();
        let mut failure: Option<TransferError> = None;

        for plan in planner.blocks() {
            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| TransferError::invalid("Upload worker pool closed"))?,
            };
            let data = match source.read_range(plan.range.clone()).await {
                Ok(data) => data,
                Err(err) => {
                    abort.cancel();
                    failure = Some(err);
                    break;
                }
            };

            statuses[plan.index as usize] = BlockStatus::InFlight;
            let store = self.store.clone();
            let retry = self.config.block_retry.clone();
            let container = container.clone();
            let blob = blob.clone();
            let task_abort = abort.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let what = format!("stage block {}", plan.id);
                let result = with_retry(&retry, &task_abort, &what, || {
                    store.stage_block(&container, &blob, &plan.id, data.clone())
                })
                .await;
                if result.is_err() {
                    task_abort.cancel();
                }
                (plan.index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(()))) => {
                    statuses[index as usize] = BlockStatus::Acknowledged;
                    debug!(block = index, "Block acknowledged");
                }
                Ok((index, Err(err))) => {
                    statuses[index as usize] = BlockStatus::Failed;
                    // Prefer the error that triggered the abort over the cancellations it caused
                    let replace = match &failure {
                        None => true,
                        Some(TransferError::Canceled) => !matches!(err, TransferError::Canceled),
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some(err);
                    }
                }
                Err(join_err) => {
                    abort.cancel();
                    failure.get_or_insert_with(|| {
                        TransferError::fatal_transfer(1, format!("Block task panicked: {}", join_err))
                    });
                }
            }
        }

        let acknowledged = statuses
            .iter()
            .filter(|s| **s == BlockStatus::Acknowledged)
            .count();

        if let Some(err) = failure {
            warn!(acknowledged, total = statuses.len(), %err, "Block upload failed; nothing committed");
            return Err(err);
        }
        if cancel.is_cancelled() || acknowledged != statuses.len() {
            return Err(TransferError::Canceled);
        }

        Ok(planner.blocks().map(|plan| plan.id).collect())
    }

    async fn abort(&self, container: &ContainerName, blob: &BlobName) {
        if let Err(err) = self.store.abort_blocks(container, blob).await {
            warn!(%err, "Failed to discard staged blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlobState, MemoryObjectStore, RetryConfig};
    use bytes::Bytes;
    use std::time::Duration;

    fn names() -> (ContainerName, BlobName) {
        (ContainerName::new("upload-test").unwrap(), BlobName::new("payload.bin").unwrap())
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    async fn setup(store: MemoryObjectStore) -> (Arc<MemoryObjectStore>, ContainerName, BlobName) {
        let store = Arc::new(store);
        let (container, blob) = names();
        store.create_container(&container).await.unwrap();
        (store, container, blob)
    }

    fn config() -> TransferConfig {
        TransferConfig::new()
            .with_block_size(16)
            .with_parallelism(3)
            .with_block_retry(RetryConfig::new(3))
            .without_backoff()
    }

    #[tokio::test]
    async fn small_source_takes_the_single_put_path() {
        let (store, container, blob) = setup(MemoryObjectStore::new()).await;
        let uploader = ParallelUploader::new(store.clone(), config());

        let receipt = uploader
            .upload(&container, &blob, &payload(10), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.method, UploadMethod::Single);
        let calls = store.calls();
        assert_eq!(calls.put_blob, 1);
        assert_eq!(calls.stage_block, 0);
        assert_eq!(calls.commit_blocks, 0);
    }

    #[tokio::test]
    async fn blocks_commit_in_chunk_order() {
        let (store, container, blob) = setup(MemoryObjectStore::new()).await;
        let uploader = ParallelUploader::new(store.clone(), config());

        let receipt = uploader
            .upload(&container, &blob, &payload(100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.method, UploadMethod::Blocks { block_size: 16, block_count: 7 });
        let committed = store.committed_blocks(&container, &blob).unwrap();
        let expected: Vec<_> = (0..7).map(BlockId::from_index).collect();
        assert_eq!(committed, expected);
        assert_eq!(store.calls().commit_blocks, 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_pool_size() {
        let store = MemoryObjectStore::new().with_stage_delay(Duration::from_millis(20));
        let (store, container, blob) = setup(store).await;
        let uploader = ParallelUploader::new(store.clone(), config());

        uploader
            .upload(&container, &blob, &payload(160), &CancellationToken::new())
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(calls.acknowledged_blocks, 10);
        assert!(calls.peak_concurrent_stages <= 3);
        assert!(calls.peak_concurrent_stages >= 2);
    }

    #[tokio::test]
    async fn transient_block_failures_are_retried() {
        let (store, container, blob) = setup(MemoryObjectStore::new()).await;
        store.fail_block_transiently(2, 2);
        let uploader = ParallelUploader::new(store.clone(), config());

        uploader
            .upload(&container, &blob, &payload(64), &CancellationToken::new())
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(calls.stage_block, 6);
        assert_eq!(calls.acknowledged_blocks, 4);
        assert_eq!(store.blob_state(&container, &blob), Some(BlobState::Committed));
    }

    #[tokio::test]
    async fn exhausted_block_retries_prevent_the_commit() {
        let (store, container, blob) = setup(MemoryObjectStore::new()).await;
        store.fail_block_transiently(1, 10);
        let uploader = ParallelUploader::new(store.clone(), config());

        let err = uploader
            .upload(&container, &blob, &payload(64), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::FatalTransfer { attempts: 3, .. }));
        let calls = store.calls();
        assert_eq!(calls.commit_blocks, 0);
        assert_eq!(calls.abort_blocks, 1);
        assert_eq!(store.blob_state(&container, &blob), None);
    }

    #[tokio::test]
    async fn fatal_block_failure_is_not_retried() {
        let (store, container, blob) = setup(MemoryObjectStore::new()).await;
        store.fail_block_fatally(0);
        let uploader = ParallelUploader::new(store.clone(), config().with_parallelism(1));

        let err = uploader
            .upload(&container, &blob, &payload(64), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Store { .. }));
        assert_eq!(store.calls().commit_blocks, 0);
    }

    #[tokio::test]
    async fn commit_failure_surfaces_as_commit_error() {
        let (store, container, blob) = setup(MemoryObjectStore::new()).await;
        store.fail_commit();
        let uploader = ParallelUploader::new(store.clone(), config());

        let err = uploader
            .upload(&container, &blob, &payload(64), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Commit { .. }));
        let calls = store.calls();
        assert_eq!(calls.commit_blocks, 1);
        assert_eq!(calls.abort_blocks, 1);
        assert_eq!(store.blob_state(&container, &blob), None);
    }

    #[tokio::test]
    async fn cancellation_aborts_without_commit() {
        let store = MemoryObjectStore::new().with_stage_delay(Duration::from_millis(200));
        let (store, container, blob) = setup(store).await;
        let uploader = ParallelUploader::new(store.clone(), config());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = uploader
            .upload(&container, &blob, &payload(160), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Canceled));
        assert_eq!(store.calls().commit_blocks, 0);
        assert_ne!(store.blob_state(&container, &blob), Some(BlobState::Committed));
    }

    #[tokio::test]
    async fn store_minimum_raises_block_size() {
        let store = MemoryObjectStore::new()
            .with_capabilities(crate::StoreCapabilities::basic().with_block_limits(Some(32), None, None));
        let (store, container, blob) = setup(store).await;
        let uploader = ParallelUploader::new(store.clone(), config());

        let receipt = uploader
            .upload(&container, &blob, &payload(100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.method, UploadMethod::Blocks { block_size: 32, block_count: 4 });
    }
}
