use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::{TransferError, TransferResult};

/// Random-access byte source an upload reads its blocks from
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `range`, which lies within `0..len()`
    async fn read_range(&self, range: Range<u64>) -> TransferResult<Bytes>;
}

fn check_range(range: &Range<u64>, len: u64) -> TransferResult<()> {
    if range.start > range.end || range.end > len {
        return Err(TransferError::invalid(format!(
            "Range {}..{} is outside a source of {} bytes",
            range.start, range.end, len
        )));
    }
    Ok(())
}

#[async_trait]
impl BlockSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn read_range(&self, range: Range<u64>) -> TransferResult<Bytes> {
        check_range(&range, BlockSource::len(self))?;
        Ok(self.slice(range.start as usize..range.end as usize))
    }
}

/// A local file read block by block
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
    file: Mutex<tokio::fs::File>,
}

impl FileSource {
    pub async fn open<P: AsRef<Path>>(path: P) -> TransferResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            len,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, range: Range<u64>) -> TransferResult<Bytes> {
        check_range(&range, self.len)?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(range.start)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
