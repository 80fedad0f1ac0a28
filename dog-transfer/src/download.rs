use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::{backoff, exhausted};
use crate::{BlobName, ContainerName, ObjectStore, RetryConfig, StoreError, TransferError, TransferResult};

/// Opens blob reads that survive dropped connections
pub struct RetryingDownloader {
    store: Arc<dyn ObjectStore>,
    max_retries: u32,
    backoff: RetryConfig,
}

impl RetryingDownloader {
    pub fn new(store: Arc<dyn ObjectStore>, max_retries: u32, backoff: RetryConfig) -> Self {
        Self {
            store,
            max_retries,
            backoff,
        }
    }

    /// Read `blob` from `offset`, through `length` bytes or to the end of the blob
    pub fn open(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        offset: u64,
        length: Option<u64>,
        cancel: &CancellationToken,
    ) -> RetryReader {
        let store = self.store.clone();
        let container = container.clone();
        let blob = blob.clone();
        let max_retries = self.max_retries;
        let backoff_config = self.backoff.clone();
        let cancel = cancel.clone();

        let stream = async_stream::try_stream! {
            let mut position = offset;
            let mut end = length.map(|len| offset.saturating_add(len));
            let mut retries = 0u32;

            'read: loop {
                if end.is_some_and(|end| position >= end) {
                    break;
                }
                let remaining = end.map(|end| end - position);

                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransferError::Canceled),
                    opened = store.get_blob(&container, &blob, position, remaining) => Ok(opened),
                }?;

                let mut body = match opened {
                    Ok(read) => {
                        let blob_end = read.total_size;
                        check_range_end(*end.get_or_insert(blob_end), blob_end, &blob)?;
                        read.body
                    }
                    Err(err) => {
                        retry_or_fail(&mut retries, max_retries, &blob, err)?;
                        backoff(&backoff_config, retries, &cancel).await?;
                        continue 'read;
                    }
                };

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(TransferError::Canceled),
                        next = body.next() => Ok(next),
                    }?;
                    match next {
                        Some(Ok(chunk)) => {
                            position += chunk.len() as u64;
                            yield chunk;
                        }
                        Some(Err(err)) => {
                            retry_or_fail(&mut retries, max_retries, &blob, err)?;
                            backoff(&backoff_config, retries, &cancel).await?;
                            continue 'read;
                        }
                        None => break,
                    }
                }

                // Body ended; short bodies are a dropped connection
                let end = end.unwrap_or(position);
                if position < end {
                    let err = StoreError::transient(format!(
                        "Body ended at {} of {} bytes",
                        position, end
                    ));
                    retry_or_fail(&mut retries, max_retries, &blob, err)?;
                    backoff(&backoff_config, retries, &cancel).await?;
                    continue 'read;
                }
                break;
            }
            debug!(blob = %blob, bytes = position - offset, retries, "Download complete");
        };

        RetryReader {
            inner: Box::pin(stream),
        }
    }
}

fn check_range_end(end: u64, blob_end: u64, blob: &BlobName) -> TransferResult<()> {
    if end > blob_end {
        return Err(TransferError::invalid(format!(
            "Requested range ends at {} but {} holds {} bytes",
            end, blob, blob_end
        )));
    }
    Ok(())
}

/// Count one reopen, or fail if the error is not worth one
fn retry_or_fail(retries: &mut u32, max_retries: u32, blob: &BlobName, err: StoreError) -> TransferResult<()> {
    if !err.is_transient() {
        return Err(err.into());
    }
    if *retries >= max_retries {
        return Err(exhausted(*retries + 1, &format!("read {}", blob), &err));
    }
    *retries += 1;
    warn!(blob = %blob, retry = *retries, max_retries, %err, "Read interrupted, reopening");
    Ok(())
}

/// Sequential reader over a blob; reconnects are invisible to the caller
pub struct RetryReader {
    inner: Pin<Box<dyn Stream<Item = TransferResult<Bytes>> + Send>>,
}

impl RetryReader {
    /// Buffer the whole remaining content in memory
    pub async fn read_to_end(mut self) -> TransferResult<Bytes> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content.freeze())
    }

    /// Adapt to [`AsyncRead`]; errors become `std::io::Error`
    pub fn into_async_read(self) -> impl AsyncRead + Send {
        StreamReader::new(self.map(|chunk| chunk.map_err(std::io::Error::other)))
    }
}

impl Stream for RetryReader {
    type Item = TransferResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
