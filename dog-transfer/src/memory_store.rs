use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    BlobDescriptor, BlobName, BlobPage, BlobRead, BlobState, BlockId, ContainerName, ObjectStore,
    PageToken, StoreCapabilities, StoreError, StoreResult,
};

const DEFAULT_PAGE_SIZE: u32 = 5000;
const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// In-memory object store for testing and development.
///
/// Staged blocks stay invisible until committed, block ids must be valid
/// base64 of equal length per blob, and every call is counted. Faults can be
/// injected to exercise the retry paths.
pub struct MemoryObjectStore {
    containers: RwLock<HashMap<ContainerName, ContainerState>>,
    faults: RwLock<Faults>,
    calls: CallCounters,
    capabilities: StoreCapabilities,
    page_size: u32,
    read_chunk: usize,
    interleave_empty_pages: bool,
    stage_delay: Option<Duration>,
}

#[derive(Default)]
struct ContainerState {
    committed: BTreeMap<BlobName, CommittedBlob>,
    staged: HashMap<BlobName, BTreeMap<BlockId, Bytes>>,
}

struct CommittedBlob {
    data: Bytes,
    blocks: Vec<BlockId>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct Faults {
    /// block index -> transient failures left
    transient_blocks: HashMap<u32, u32>,
    fatal_blocks: Vec<u32>,
    read_interruptions: u32,
    open_failures: u32,
    fail_commit: bool,
    fail_create: bool,
    fail_delete: bool,
}

#[derive(Default)]
struct CallCounters {
    create_container: AtomicU32,
    delete_container: AtomicU32,
    put_blob: AtomicU32,
    stage_block: AtomicU32,
    acknowledged_blocks: AtomicU32,
    commit_blocks: AtomicU32,
    abort_blocks: AtomicU32,
    list_pages: AtomicU32,
    get_blob: AtomicU32,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Snapshot of how often each store operation was called
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub create_container: u32,
    pub delete_container: u32,
    pub put_blob: u32,
    pub stage_block: u32,
    pub acknowledged_blocks: u32,
    pub commit_blocks: u32,
    pub abort_blocks: u32,
    pub list_pages: u32,
    pub get_blob: u32,
    /// Highest number of stage_block calls observed running at once
    pub peak_concurrent_stages: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            calls: CallCounters::default(),
            capabilities: StoreCapabilities::basic().with_block_limits(None, None, Some(50_000)),
            page_size: DEFAULT_PAGE_SIZE,
            read_chunk: DEFAULT_READ_CHUNK,
            interleave_empty_pages: false,
            stage_delay: None,
        }
    }

    /// Cap the number of blobs returned per listing page
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Return an empty page with a live token before every real page
    pub fn with_empty_pages(mut self) -> Self {
        self.interleave_empty_pages = true;
        self
    }

    /// Size of the chunks a read body is split into
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    /// Hold each stage_block call for `delay` so concurrency can be observed
    pub fn with_stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = Some(delay);
        self
    }

    pub fn with_capabilities(mut self, capabilities: StoreCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fail the next `times` stage attempts of block `index` with a transient error
    pub fn fail_block_transiently(&self, index: u32, times: u32) {
        self.faults.write().transient_blocks.insert(index, times);
    }

    /// Reject every stage attempt of block `index` with a fatal error
    pub fn fail_block_fatally(&self, index: u32) {
        self.faults.write().fatal_blocks.push(index);
    }

    /// Drop the next `times` read bodies after their first chunk
    pub fn interrupt_reads(&self, times: u32) {
        self.faults.write().read_interruptions = times;
    }

    /// Fail the next `times` get_blob calls before any body is returned
    pub fn fail_opens(&self, times: u32) {
        self.faults.write().open_failures = times;
    }

    pub fn fail_commit(&self) {
        self.faults.write().fail_commit = true;
    }

    pub fn fail_create(&self) {
        self.faults.write().fail_create = true;
    }

    pub fn fail_delete(&self) {
        self.faults.write().fail_delete = true;
    }

    pub fn calls(&self) -> StoreCalls {
        let c = &self.calls;
        StoreCalls {
            create_container: c.create_container.load(Ordering::SeqCst),
            delete_container: c.delete_container.load(Ordering::SeqCst),
            put_blob: c.put_blob.load(Ordering::SeqCst),
            stage_block: c.stage_block.load(Ordering::SeqCst),
            acknowledged_blocks: c.acknowledged_blocks.load(Ordering::SeqCst),
            commit_blocks: c.commit_blocks.load(Ordering::SeqCst),
            abort_blocks: c.abort_blocks.load(Ordering::SeqCst),
            list_pages: c.list_pages.load(Ordering::SeqCst),
            get_blob: c.get_blob.load(Ordering::SeqCst),
            peak_concurrent_stages: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn container_exists(&self, container: &ContainerName) -> bool {
        self.containers.read().contains_key(container)
    }

    /// State of a blob, `None` if it has neither staged blocks nor a commit
    pub fn blob_state(&self, container: &ContainerName, blob: &BlobName) -> Option<BlobState> {
        let containers = self.containers.read();
        let state = containers.get(container)?;
        if state.committed.contains_key(blob) {
            Some(BlobState::Committed)
        } else if state.staged.contains_key(blob) {
            Some(BlobState::Uncommitted)
        } else {
            None
        }
    }

    pub fn committed_blocks(&self, container: &ContainerName, blob: &BlobName) -> Option<Vec<BlockId>> {
        let containers = self.containers.read();
        containers
            .get(container)?
            .committed
            .get(blob)
            .map(|b| b.blocks.clone())
    }

    /// Insert a committed blob directly, bypassing the call counters
    pub fn seed_blob(&self, container: &ContainerName, blob: BlobName, data: Bytes) {
        let mut containers = self.containers.write();
        let state = containers.entry(container.clone()).or_default();
        state.committed.insert(blob, CommittedBlob::new(data, Vec::new()));
    }

    fn check_stage_faults(&self, block: &BlockId) -> StoreResult<()> {
        let index = block.index();
        let mut faults = self.faults.write();
        if faults.fatal_blocks.contains(&index) {
            return Err(StoreError::fatal(format!("Block {} rejected", block)));
        }
        if let Some(left) = faults.transient_blocks.get_mut(&index) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::transient(format!("Connection reset staging block {}", block)));
            }
        }
        Ok(())
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl CommittedBlob {
    fn new(data: Bytes, blocks: Vec<BlockId>) -> Self {
        Self {
            etag: format!("\"{}\"", uuid::Uuid::new_v4().simple()),
            data,
            blocks,
            last_modified: Utc::now(),
        }
    }
}

/// Counts one running stage_block call, also when its future is dropped early
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(calls: &'a CallCounters) -> Self {
        let now = calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        calls.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(&calls.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn missing_container(container: &ContainerName) -> StoreError {
    StoreError::not_found(format!("Container {} does not exist", container))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create_container(&self, container: &ContainerName) -> StoreResult<()> {
        self.calls.create_container.fetch_add(1, Ordering::SeqCst);
        if self.faults.read().fail_create {
            return Err(StoreError::fatal("Container creation refused"));
        }
        let mut containers = self.containers.write();
        if containers.contains_key(container) {
            return Err(StoreError::already_exists(format!("Container {} already exists", container)));
        }
        containers.insert(container.clone(), ContainerState::default());
        Ok(())
    }

    async fn delete_container(&self, container: &ContainerName) -> StoreResult<()> {
        self.calls.delete_container.fetch_add(1, Ordering::SeqCst);
        if self.faults.read().fail_delete {
            return Err(StoreError::transient("Container delete timed out"));
        }
        self.containers
            .write()
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| missing_container(container))
    }

    async fn put_blob(&self, container: &ContainerName, blob: &BlobName, data: Bytes) -> StoreResult<()> {
        self.calls.put_blob.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.write();
        let state = containers.get_mut(container).ok_or_else(|| missing_container(container))?;
        state.staged.remove(blob);
        state.committed.insert(blob.clone(), CommittedBlob::new(data, Vec::new()));
        Ok(())
    }

    async fn stage_block(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        block: &BlockId,
        data: Bytes,
    ) -> StoreResult<()> {
        self.calls.stage_block.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.calls);

        if let Some(delay) = self.stage_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.stage_block_now(container, blob, block, data);

        if result.is_ok() {
            self.calls.acknowledged_blocks.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn commit_blocks(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        blocks: &[BlockId],
    ) -> StoreResult<()> {
        self.calls.commit_blocks.fetch_add(1, Ordering::SeqCst);
        if self.faults.read().fail_commit {
            return Err(StoreError::fatal(format!("Block list for {} rejected", blob)));
        }

        let mut containers = self.containers.write();
        let state = containers.get_mut(container).ok_or_else(|| missing_container(container))?;
        let staged = state
            .staged
            .get(blob)
            .ok_or_else(|| StoreError::fatal(format!("No staged blocks for {}", blob)))?;

        let mut data = Vec::new();
        for id in blocks {
            let chunk = staged
                .get(id)
                .ok_or_else(|| StoreError::fatal(format!("Block {} of {} was never staged", id, blob)))?;
            data.extend_from_slice(chunk);
        }

        state.staged.remove(blob);
        state
            .committed
            .insert(blob.clone(), CommittedBlob::new(Bytes::from(data), blocks.to_vec()));
        Ok(())
    }

    async fn abort_blocks(&self, container: &ContainerName, blob: &BlobName) -> StoreResult<()> {
        self.calls.abort_blocks.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = self.containers.write().get_mut(container) {
            state.staged.remove(blob);
        }
        Ok(())
    }

    async fn list_blobs_page(
        &self,
        container: &ContainerName,
        token: &PageToken,
        max_results: Option<u32>,
    ) -> StoreResult<BlobPage> {
        self.calls.list_pages.fetch_add(1, Ordering::SeqCst);

        let raw = token.as_str();
        let (empty_marker, offset) = match raw.strip_prefix('e') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let offset: usize = if offset.is_empty() {
            0
        } else {
            offset
                .parse()
                .map_err(|_| StoreError::fatal(format!("Invalid continuation token {:?}", raw)))?
        };

        if self.interleave_empty_pages && !empty_marker {
            return Ok(BlobPage {
                blobs: Vec::new(),
                next: PageToken::new(format!("e{}", offset)),
            });
        }

        let containers = self.containers.read();
        let state = containers.get(container).ok_or_else(|| missing_container(container))?;
        let page_size = max_results.unwrap_or(self.page_size).min(self.page_size).max(1) as usize;

        let blobs: Vec<_> = state
            .committed
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|(name, blob)| BlobDescriptor {
                name: name.clone(),
                size_bytes: blob.data.len() as u64,
                etag: Some(blob.etag.clone()),
                last_modified: Some(blob.last_modified),
            })
            .collect();

        let consumed = offset + blobs.len();
        let next = if consumed < state.committed.len() {
            PageToken::new(consumed.to_string())
        } else {
            PageToken::start()
        };
        Ok(BlobPage { blobs, next })
    }

    async fn get_blob(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        offset: u64,
        length: Option<u64>,
    ) -> StoreResult<BlobRead> {
        self.calls.get_blob.fetch_add(1, Ordering::SeqCst);

        let interrupted = {
            let mut faults = self.faults.write();
            if Self::take_fault(&mut faults.open_failures) {
                return Err(StoreError::transient(format!("Timed out opening {}", blob)));
            }
            Self::take_fault(&mut faults.read_interruptions)
        };

        let data = {
            let containers = self.containers.read();
            let state = containers.get(container).ok_or_else(|| missing_container(container))?;
            state
                .committed
                .get(blob)
                .map(|b| b.data.clone())
                .ok_or_else(|| StoreError::not_found(format!("Blob {} does not exist", blob)))?
        };

        let total_size = data.len() as u64;
        if offset > total_size {
            return Err(StoreError::fatal(format!(
                "Range start {} is past the end of {} ({} bytes)",
                offset, blob, total_size
            )));
        }
        let end = length.map_or(total_size, |len| offset.saturating_add(len).min(total_size));
        let body = data.slice(offset as usize..end as usize);
        let chunk = self.read_chunk;

        let stream = async_stream::stream! {
            let mut sent = 0;
            while sent < body.len() {
                let next = (sent + chunk).min(body.len());
                yield Ok(body.slice(sent..next));
                sent = next;
                if interrupted {
                    yield Err(StoreError::transient("Connection reset by peer"));
                    return;
                }
            }
            if interrupted {
                yield Err(StoreError::transient("Connection reset by peer"));
            }
        };

        Ok(BlobRead {
            body: Box::pin(stream),
            total_size,
        })
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities.clone()
    }
}

impl MemoryObjectStore {
    fn stage_block_now(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        block: &BlockId,
        data: Bytes,
    ) -> StoreResult<()> {
        self.check_stage_faults(block)?;

        if base64::engine::general_purpose::STANDARD.decode(block.as_str()).is_err() {
            return Err(StoreError::fatal(format!("Block id {} is not valid base64", block)));
        }
        if let Some(max) = self.capabilities.max_block_size {
            if data.len() as u64 > max {
                return Err(StoreError::fatal(format!("Block {} exceeds {} bytes", block, max)));
            }
        }

        let mut containers = self.containers.write();
        let state = containers.get_mut(container).ok_or_else(|| missing_container(container))?;
        let staged = state.staged.entry(blob.clone()).or_default();
        if let Some((existing, _)) = staged.iter().next() {
            if existing.as_str().len() != block.as_str().len() {
                return Err(StoreError::fatal("Block ids of one blob must share a length"));
            }
        }
        staged.insert(block.clone(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn names() -> (ContainerName, BlobName) {
        (ContainerName::new("memory-test").unwrap(), BlobName::new("blob").unwrap())
    }

    #[tokio::test]
    async fn staged_blocks_are_invisible_until_commit() {
        let store = MemoryObjectStore::new();
        let (container, blob) = names();
        store.create_container(&container).await.unwrap();

        let ids = [BlockId::from_index(0), BlockId::from_index(1)];
        store.stage_block(&container, &blob, &ids[1], Bytes::from_static(b"world")).await.unwrap();
        store.stage_block(&container, &blob, &ids[0], Bytes::from_static(b"hello ")).await.unwrap();

        assert_eq!(store.blob_state(&container, &blob), Some(BlobState::Uncommitted));
        let err = store.get_blob(&container, &blob, 0, None).await.err().unwrap();
        assert_eq!(err.kind, crate::StoreErrorKind::NotFound);

        store.commit_blocks(&container, &blob, &ids).await.unwrap();
        assert_eq!(store.blob_state(&container, &blob), Some(BlobState::Committed));

        let mut read = store.get_blob(&container, &blob, 0, None).await.unwrap();
        let mut content = Vec::new();
        while let Some(chunk) = read.body.next().await {
            content.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn dropped_stage_call_releases_its_in_flight_slot() {
        let store = MemoryObjectStore::new().with_stage_delay(Duration::from_millis(50));
        let (container, blob) = names();
        store.create_container(&container).await.unwrap();

        let dropped = tokio::time::timeout(
            Duration::from_millis(5),
            store.stage_block(&container, &blob, &BlockId::from_index(0), Bytes::from_static(b"a")),
        )
        .await;
        assert!(dropped.is_err());

        store
            .stage_block(&container, &blob, &BlockId::from_index(1), Bytes::from_static(b"b"))
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(calls.stage_block, 2);
        assert_eq!(calls.acknowledged_blocks, 1);
        assert_eq!(calls.peak_concurrent_stages, 1);
    }

    #[tokio::test]
    async fn duplicate_container_reports_already_exists() {
        let store = MemoryObjectStore::new();
        let (container, _) = names();
        store.create_container(&container).await.unwrap();
        let err = store.create_container(&container).await.unwrap_err();
        assert_eq!(err.kind, crate::StoreErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn commit_of_unknown_block_is_rejected() {
        let store = MemoryObjectStore::new();
        let (container, blob) = names();
        store.create_container(&container).await.unwrap();
        store
            .stage_block(&container, &blob, &BlockId::from_index(0), Bytes::from_static(b"a"))
            .await
            .unwrap();

        let err = store
            .commit_blocks(&container, &blob, &[BlockId::from_index(0), BlockId::from_index(1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::StoreErrorKind::Fatal);
        assert_eq!(store.blob_state(&container, &blob), Some(BlobState::Uncommitted));
    }

    #[tokio::test]
    async fn listing_pages_through_all_blobs() {
        let store = MemoryObjectStore::new().with_page_size(2);
        let (container, _) = names();
        store.create_container(&container).await.unwrap();
        for i in 0..5 {
            store.seed_blob(&container, BlobName::new(format!("b{}", i)).unwrap(), Bytes::new());
        }

        let first = store.list_blobs_page(&container, &PageToken::start(), None).await.unwrap();
        assert_eq!(first.blobs.len(), 2);
        assert!(!first.next.is_exhausted());

        let second = store.list_blobs_page(&container, &first.next, None).await.unwrap();
        let third = store.list_blobs_page(&container, &second.next, None).await.unwrap();
        assert_eq!(third.blobs.len(), 1);
        assert!(third.next.is_exhausted());
    }
}
