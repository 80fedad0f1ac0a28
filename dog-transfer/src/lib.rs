//! # dog-transfer: Chunked, retrying object-storage transfers
//!
//! `dog-transfer` moves blobs between local data and an object store. Large
//! payloads are split into fixed-size blocks, staged in parallel and made
//! visible with a single commit. Listings are paged lazily and downloads
//! reopen themselves after dropped connections.
//!
//! ## Key Features
//!
//! - **Parallel block uploads**: bounded concurrency, per-block retries, one commit
//! - **Lazy paging**: listings fetch pages only as they are consumed
//! - **Resumable reads**: a download survives interruptions up to a retry budget
//! - **Storage agnostic**: S3-compatible services or the in-process memory store
//! - **Cancellation**: every step honours a `CancellationToken`
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_transfer::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let store = Arc::new(MemoryObjectStore::new());
//! let config = TransferConfig::default().with_scratch_dir(std::env::temp_dir());
//!
//! let report = TransferOrchestrator::new(store, config)
//!     .run_default(&CancellationToken::new())
//!     .await;
//!
//! print!("{}", report.log);
//! report.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────┐
//! │ TransferOrchestrator  │  ← create → upload → list → download → cleanup
//! ├───────────────────────┤
//! │ ParallelUploader      │
//! │ BlobPager             │  ← one concern each
//! │ RetryingDownloader    │
//! ├───────────────────────┤
//! │ ObjectStore           │  ← storage primitives
//! └───────────────────────┘
//! ```

mod chunk;
mod config;
mod download;
mod error;
mod list;
mod memory_store;
mod orchestrator;
mod retry;
mod s3_store;
mod scratch;
mod source;
pub mod store;
mod types;
mod upload;

pub use chunk::{Blocks, ChunkPlanner};
pub use config::{TransferConfig, DEFAULT_BLOCK_SIZE, DEFAULT_PARALLELISM, DEFAULT_READ_RETRIES};
pub use download::{RetryReader, RetryingDownloader};
pub use error::{StoreError, StoreErrorKind, StoreResult, TransferError, TransferResult};
pub use list::BlobPager;
pub use memory_store::{MemoryObjectStore, StoreCalls};
pub use orchestrator::{
    FixedNameGenerator, NameGenerator, RandomNameGenerator, TransferLog, TransferOrchestrator, TransferReport,
    TransferState, DEFAULT_PAYLOAD,
};
pub use retry::RetryConfig;
pub use s3_store::{S3CompatibleStore, S3Config};
pub use scratch::ScratchFile;
pub use source::{BlockSource, FileSource};
pub use store::{ObjectStore, StoreCapabilities};
pub use types::{
    BlobDescriptor, BlobName, BlobPage, BlobRead, BlobState, BlockId, BlockPlan, BlockStatus, BodyStream,
    ContainerName, Credentials, PageToken, BLOCK_ID_WIDTH, MAX_BLOCK_COUNT,
};
pub use upload::{ParallelUploader, UploadMethod, UploadReceipt};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobName, BlobPager, ContainerName, Credentials, MemoryObjectStore, ObjectStore, ParallelUploader,
        RetryingDownloader, S3CompatibleStore, S3Config, TransferConfig, TransferError, TransferOrchestrator,
        TransferResult,
    };
}
