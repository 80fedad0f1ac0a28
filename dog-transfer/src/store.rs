use async_trait::async_trait;
use bytes::Bytes;

use crate::{BlobName, BlobPage, BlobRead, BlockId, ContainerName, PageToken, StoreResult};

/// Remote object-storage operations the transfer workflow relies on.
///
/// Every failure carries a [`StoreErrorKind`](crate::StoreErrorKind) so the
/// caller can decide between ignoring, retrying and giving up.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create an empty container. Fails with `AlreadyExists` if it is taken.
    async fn create_container(&self, container: &ContainerName) -> StoreResult<()>;

    /// Delete a container together with everything in it
    async fn delete_container(&self, container: &ContainerName) -> StoreResult<()>;

    /// Write a whole blob in one call; it is readable once this returns
    async fn put_blob(&self, container: &ContainerName, blob: &BlobName, data: Bytes) -> StoreResult<()>;

    /// Stage one block of a blob. Staged blocks are not readable.
    async fn stage_block(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        block: &BlockId,
        data: Bytes,
    ) -> StoreResult<()>;

    /// Assemble staged blocks, in the given order, into the readable blob
    async fn commit_blocks(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        blocks: &[BlockId],
    ) -> StoreResult<()>;

    /// Discard staged blocks of an upload that will never be committed
    async fn abort_blocks(&self, _container: &ContainerName, _blob: &BlobName) -> StoreResult<()> {
        Ok(())
    }

    /// Fetch one page of committed blobs starting at `token`
    async fn list_blobs_page(
        &self,
        container: &ContainerName,
        token: &PageToken,
        max_results: Option<u32>,
    ) -> StoreResult<BlobPage>;

    /// Read a committed blob from `offset`, through `length` bytes or to the end
    async fn get_blob(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        offset: u64,
        length: Option<u64>,
    ) -> StoreResult<BlobRead>;

    /// Get store capabilities
    fn capabilities(&self) -> StoreCapabilities;
}

/// Limits a store imposes on block uploads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Smallest block accepted, except for the final block
    pub min_block_size: Option<u64>,
    pub max_block_size: Option<u64>,
    pub max_blocks: Option<u32>,
}

impl StoreCapabilities {
    pub fn basic() -> Self {
        Self::default()
    }

    pub fn with_block_limits(mut self, min_size: Option<u64>, max_size: Option<u64>, max_blocks: Option<u32>) -> Self {
        self.min_block_size = min_size;
        self.max_block_size = max_size;
        self.max_blocks = max_blocks;
        self
    }

    /// Clamp a requested block size into the store's accepted range
    pub fn effective_block_size(&self, requested: u64) -> u64 {
        let size = self.min_block_size.map_or(requested, |min| requested.max(min));
        self.max_block_size.map_or(size, |max| size.min(max))
    }
}
