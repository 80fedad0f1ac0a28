use std::collections::VecDeque;
use std::sync::Arc;

use futures_core::Stream;
use tracing::debug;

use crate::{BlobDescriptor, ContainerName, ObjectStore, PageToken, TransferResult};

/// Lazy listing of a container's committed blobs.
///
/// Pages are requested on demand, starting from the empty token and stopping
/// only once the store hands back an empty token. Pages with no entries but
/// a live token are skipped. A pager cannot be rewound; start a new one to
/// list again.
pub struct BlobPager {
    store: Arc<dyn ObjectStore>,
    container: ContainerName,
    page_size: Option<u32>,
    token: PageToken,
    buffer: VecDeque<BlobDescriptor>,
    exhausted: bool,
    pages: u32,
}

impl BlobPager {
    pub fn new(store: Arc<dyn ObjectStore>, container: ContainerName, page_size: Option<u32>) -> Self {
        Self {
            store,
            container,
            page_size,
            token: PageToken::start(),
            buffer: VecDeque::new(),
            exhausted: false,
            pages: 0,
        }
    }

    /// Whether another descriptor remains, fetching pages as needed
    pub async fn has_next(&mut self) -> TransferResult<bool> {
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(!self.buffer.is_empty())
    }

    /// The next descriptor, or `None` once the listing is exhausted
    pub async fn next(&mut self) -> TransferResult<Option<BlobDescriptor>> {
        if self.has_next().await? {
            Ok(self.buffer.pop_front())
        } else {
            Ok(None)
        }
    }

    /// Drain the remaining descriptors
    pub async fn collect(mut self) -> TransferResult<Vec<BlobDescriptor>> {
        let mut blobs = Vec::new();
        while let Some(blob) = self.next().await? {
            blobs.push(blob);
        }
        Ok(blobs)
    }

    /// Number of pages requested so far
    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub fn into_stream(mut self) -> impl Stream<Item = TransferResult<BlobDescriptor>> + Send {
        async_stream::try_stream! {
            while let Some(blob) = self.next().await? {
                yield blob;
            }
        }
    }

    async fn fetch_page(&mut self) -> TransferResult<()> {
        let page = self
            .store
            .list_blobs_page(&self.container, &self.token, self.page_size)
            .await?;
        self.pages += 1;
        debug!(
            container = %self.container,
            page = self.pages,
            entries = page.blobs.len(),
            more = !page.next.is_exhausted(),
            "Fetched listing page"
        );
        self.buffer.extend(page.blobs);
        self.exhausted = page.next.is_exhausted();
        self.token = page.next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlobName, MemoryObjectStore};
    use bytes::Bytes;
    use futures_util::StreamExt;

    async fn seeded(store: MemoryObjectStore, count: usize) -> (Arc<MemoryObjectStore>, ContainerName) {
        let store = Arc::new(store);
        let container = ContainerName::new("list-test").unwrap();
        store.create_container(&container).await.unwrap();
        for i in 0..count {
            store.seed_blob(&container, BlobName::new(format!("blob-{:03}", i)).unwrap(), Bytes::new());
        }
        (store, container)
    }

    #[tokio::test]
    async fn empty_container_yields_nothing_after_one_page() {
        let (store, container) = seeded(MemoryObjectStore::new(), 0).await;
        let mut pager = BlobPager::new(store.clone(), container, None);

        assert!(!pager.has_next().await.unwrap());
        assert_eq!(pager.next().await.unwrap(), None);
        assert_eq!(pager.next().await.unwrap(), None);
        assert_eq!(pager.pages_fetched(), 1);
    }

    #[tokio::test]
    async fn count_is_independent_of_page_size() {
        for page_size in [1, 2, 3, 7, 50] {
            let (store, container) = seeded(MemoryObjectStore::new().with_page_size(page_size), 7).await;
            let blobs = BlobPager::new(store, container, None).collect().await.unwrap();
            assert_eq!(blobs.len(), 7, "page size {}", page_size);
        }
    }

    #[tokio::test]
    async fn empty_pages_with_live_tokens_do_not_end_the_listing() {
        let store = MemoryObjectStore::new().with_page_size(2).with_empty_pages();
        let (store, container) = seeded(store, 5).await;
        let mut pager = BlobPager::new(store.clone(), container, None);

        let mut names = Vec::new();
        while pager.has_next().await.unwrap() {
            names.push(pager.next().await.unwrap().unwrap().name.to_string());
        }

        assert_eq!(names, ["blob-000", "blob-001", "blob-002", "blob-003", "blob-004"]);
        // three real pages, each preceded by an empty one
        assert_eq!(store.calls().list_pages, 6);
    }

    #[tokio::test]
    async fn stream_yields_every_descriptor() {
        let (store, container) = seeded(MemoryObjectStore::new().with_page_size(4), 9).await;
        let stream = BlobPager::new(store, container, Some(4)).into_stream();
        let blobs: Vec<_> = stream.collect().await;

        assert_eq!(blobs.len(), 9);
        assert!(blobs.iter().all(|b| b.is_ok()));
    }

    #[tokio::test]
    async fn missing_container_surfaces_an_error() {
        let store = Arc::new(MemoryObjectStore::new());
        let container = ContainerName::new("not-there").unwrap();
        let mut pager = BlobPager::new(store, container, None);

        assert!(pager.next().await.is_err());
    }
}
