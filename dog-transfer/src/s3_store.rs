use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::{
    BlobDescriptor, BlobName, BlobPage, BlobRead, BlockId, ContainerName, Credentials, ObjectStore, PageToken,
    StoreCapabilities, StoreError, StoreErrorKind, StoreResult, TransferError, TransferResult,
};

/// S3 refuses parts below 5 MiB, except the last one
const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const S3_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
const S3_MAX_PARTS: u32 = 10_000;

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint (MinIO, RustFS, ...); AWS when `None`
    pub endpoint_url: Option<String>,
    pub region: String,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: "us-east-1".to_string(),
            force_path_style: false,
        }
    }
}

impl S3Config {
    pub fn new<S: Into<String>>(region: S) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_path_style(mut self, force_path_style: bool) -> Self {
        self.force_path_style = force_path_style;
        self
    }
}

/// Multipart upload in progress for one blob
struct PendingUpload {
    upload_id: String,
    parts: BTreeMap<BlockId, Option<String>>,
}

/// Object store backed by any S3-compatible service.
///
/// Containers are buckets. Staged blocks are parts of a multipart upload that
/// is started by the first staged block and completed by the commit.
pub struct S3CompatibleStore {
    client: Client,
    region: String,
    uploads: Mutex<HashMap<(ContainerName, BlobName), PendingUpload>>,
}

impl S3CompatibleStore {
    pub async fn connect(config: S3Config, credentials: Credentials) -> TransferResult<Self> {
        if config.region.trim().is_empty() {
            return Err(TransferError::invalid("S3 region must not be empty"));
        }

        let provider = aws_credential_types::Credentials::new(
            credentials.account,
            credentials.secret,
            None,
            None,
            "dog-transfer",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(provider);
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(config.force_path_style)
                .build(),
        );

        Ok(Self::from_client(client, config.region))
    }

    /// Wrap an already configured client
    pub fn from_client<S: Into<String>>(client: Client, region: S) -> Self {
        Self {
            client,
            region: region.into(),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Upload id for `blob`, starting the multipart upload on first use
    async fn upload_id(&self, container: &ContainerName, blob: &BlobName) -> StoreResult<String> {
        let mut uploads = self.uploads.lock().await;
        let key = (container.clone(), blob.clone());
        if let Some(pending) = uploads.get(&key) {
            return Ok(pending.upload_id.clone());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(container.as_str())
            .key(blob.as_str())
            .send()
            .await
            .map_err(|err| classify("create_multipart_upload", err))?;
        let upload_id = created
            .upload_id
            .ok_or_else(|| StoreError::fatal("create_multipart_upload returned no upload id"))?;

        debug!(container = %container, blob = %blob, %upload_id, "Started multipart upload");
        uploads.insert(
            key,
            PendingUpload {
                upload_id: upload_id.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn delete_all_objects(&self, container: &ContainerName) -> StoreResult<()> {
        let mut token = PageToken::start();
        loop {
            let page = self.list_blobs_page(container, &token, None).await?;
            for blob in &page.blobs {
                self.client
                    .delete_object()
                    .bucket(container.as_str())
                    .key(blob.name.as_str())
                    .send()
                    .await
                    .map_err(|err| classify("delete_object", err))?;
            }
            if page.next.is_exhausted() {
                return Ok(());
            }
            token = page.next;
        }
    }
}

#[async_trait]
impl ObjectStore for S3CompatibleStore {
    #[instrument(skip_all, fields(container = %container))]
    async fn create_container(&self, container: &ContainerName) -> StoreResult<()> {
        let mut request = self.client.create_bucket().bucket(container.as_str());
        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request.send().await.map_err(|err| classify("create_bucket", err))?;
        Ok(())
    }

    #[instrument(skip_all, fields(container = %container))]
    async fn delete_container(&self, container: &ContainerName) -> StoreResult<()> {
        self.delete_all_objects(container).await?;
        self.client
            .delete_bucket()
            .bucket(container.as_str())
            .send()
            .await
            .map_err(|err| classify("delete_bucket", err))?;
        Ok(())
    }

    async fn put_blob(&self, container: &ContainerName, blob: &BlobName, data: Bytes) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(container.as_str())
            .key(blob.as_str())
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(|err| classify("put_object", err))?;
        Ok(())
    }

    async fn stage_block(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        block: &BlockId,
        data: Bytes,
    ) -> StoreResult<()> {
        let upload_id = self.upload_id(container, blob).await?;
        let part_number = part_number(block)?;

        let uploaded = self
            .client
            .upload_part()
            .bucket(container.as_str())
            .key(blob.as_str())
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(|err| classify("upload_part", err))?;

        let mut uploads = self.uploads.lock().await;
        let pending = uploads
            .get_mut(&(container.clone(), blob.clone()))
            .ok_or_else(|| StoreError::not_found(format!("No multipart upload for {}", blob)))?;
        pending.parts.insert(block.clone(), uploaded.e_tag);
        Ok(())
    }

    #[instrument(skip_all, fields(container = %container, blob = %blob, blocks = blocks.len()))]
    async fn commit_blocks(
        &self,
        container: &ContainerName,
        blob: &BlobName,
        blocks: &[BlockId],
    ) -> StoreResult<()> {
        let key = (container.clone(), blob.clone());
        let pending = self
            .uploads
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| StoreError::not_found(format!("No staged blocks for {}", blob)))?;

        let mut parts = Vec::with_capacity(blocks.len());
        for block in blocks {
            let e_tag = pending
                .parts
                .get(block)
                .ok_or_else(|| StoreError::fatal(format!("Block {} of {} was never staged", block, blob)))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(e_tag.clone())
                    .part_number(part_number(block)?)
                    .build(),
            );
        }

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(container.as_str())
            .key(blob.as_str())
            .upload_id(&pending.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|err| classify("complete_multipart_upload", err));

        if result.is_err() {
            // Keep the upload around so the caller can still abort it
            self.uploads.lock().await.insert(key, pending);
        }
        result.map(|_| ())
    }

    async fn abort_blocks(&self, container: &ContainerName, blob: &BlobName) -> StoreResult<()> {
        let pending = self.uploads.lock().await.remove(&(container.clone(), blob.clone()));
        let Some(pending) = pending else {
            return Ok(());
        };
        self.client
            .abort_multipart_upload()
            .bucket(container.as_str())
            .key(blob.as_str())
            .upload_id(&pending.upload_id)
            .send()
            .await
            .map_err(|err| classify("abort_multipart_upload", err))?;
        Ok(())
    }

    async fn list_blobs_page(
        &self,
        container: &ContainerName,
        token: &PageToken,
        max_results: Option<u32>,
    ) -> StoreResult<BlobPage> {
        let mut request = self.client.list_objects_v2().bucket(container.as_str());
        if let Some(token) = token.as_option() {
            request = request.continuation_token(token);
        }
        if let Some(max) = max_results {
            request = request.max_keys(i32::try_from(max).unwrap_or(i32::MAX));
        }

        let output = request.send().await.map_err(|err| classify("list_objects_v2", err))?;

        let mut blobs = Vec::new();
        for object in output.contents.unwrap_or_default() {
            let Some(key) = object.key else {
                continue;
            };
            let name = BlobName::new(key).map_err(|err| StoreError::fatal(err.to_string()))?;
            blobs.push(BlobDescriptor {
                name,
                size_bytes: object.size.unwrap_or(0).max(0) as u64,
                etag: object.e_tag,
                last_modified: object
                    .last_modified
                    .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())),
            });
        }

        let next = if output.is_truncated.unwrap_or(false) {
            PageToken::from_option(output.next_continuation_token)
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
        let mut request = self.client.get_object().bucket(container.as_str()).key(blob.as_str());
        if let Some(range) = range_header(offset, length)? {
            request = request.range(range);
        }

        let output = request.send().await.map_err(|err| classify("get_object", err))?;

        let total_size = output
            .content_range
            .as_deref()
            .and_then(total_from_content_range)
            .or_else(|| output.content_length.map(|len| len.max(0) as u64 + offset))
            .unwrap_or(offset);

        let mut body = output.body;
        let stream = async_stream::stream! {
            while let Some(chunk) = body.next().await {
                yield chunk.map_err(|err| StoreError::transient(format!("Body stream interrupted: {}", err)));
            }
        };

        Ok(BlobRead {
            body: Box::pin(stream),
            total_size,
        })
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic().with_block_limits(
            Some(S3_MIN_PART_SIZE),
            Some(S3_MAX_PART_SIZE),
            Some(S3_MAX_PARTS),
        )
    }
}

fn part_number(block: &BlockId) -> StoreResult<i32> {
    i32::try_from(block.index() + 1)
        .ok()
        .filter(|n| *n as u32 <= S3_MAX_PARTS)
        .ok_or_else(|| StoreError::fatal(format!("Block {} exceeds the part limit", block)))
}

/// `Range` header for a read; `None` for a whole-object read
fn range_header(offset: u64, length: Option<u64>) -> StoreResult<Option<String>> {
    match length {
        None if offset == 0 => Ok(None),
        None => Ok(Some(format!("bytes={}-", offset))),
        Some(0) => Err(StoreError::fatal("Zero-length range requested")),
        Some(len) => Ok(Some(format!("bytes={}-{}", offset, offset.saturating_add(len) - 1))),
    }
}

/// Total object size from `bytes start-end/total`
fn total_from_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

/// Map an SDK failure onto a [`StoreErrorKind`]
fn classify<E>(operation: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreErrorKind::Transient
        }
        SdkError::ServiceError(service) => {
            kind_for(operation, service.err().code(), service.raw().status().as_u16())
        }
        _ => StoreErrorKind::Fatal,
    };
    StoreError::new(kind, format!("{} failed: {}", operation, DisplayErrorContext(&err)))
}

/// A bare 409 only means "already exists" when creating a bucket
fn kind_for(operation: &str, code: Option<&str>, status: u16) -> StoreErrorKind {
    match code {
        Some("BucketAlreadyOwnedByYou" | "BucketAlreadyExists") => StoreErrorKind::AlreadyExists,
        Some("NoSuchBucket" | "NoSuchKey" | "NoSuchUpload") => StoreErrorKind::NotFound,
        Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken") => {
            StoreErrorKind::Credential
        }
        Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable") => StoreErrorKind::Transient,
        _ => match status {
            404 => StoreErrorKind::NotFound,
            409 if operation == "create_bucket" => StoreErrorKind::AlreadyExists,
            401 | 403 => StoreErrorKind::Credential,
            408 | 429 | 500..=599 => StoreErrorKind::Transient,
            _ => StoreErrorKind::Fatal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_codes_map_to_kinds() {
        assert_eq!(
            kind_for("create_bucket", Some("BucketAlreadyOwnedByYou"), 409),
            StoreErrorKind::AlreadyExists
        );
        assert_eq!(kind_for("get_object", Some("NoSuchKey"), 404), StoreErrorKind::NotFound);
        assert_eq!(kind_for("put_object", Some("InvalidAccessKeyId"), 403), StoreErrorKind::Credential);
        assert_eq!(kind_for("upload_part", Some("SlowDown"), 503), StoreErrorKind::Transient);
        assert_eq!(kind_for("get_object", None, 502), StoreErrorKind::Transient);
        assert_eq!(kind_for("put_object", Some("MalformedXML"), 400), StoreErrorKind::Fatal);
    }

    #[test]
    fn bare_conflicts_only_mean_exists_when_creating() {
        assert_eq!(kind_for("create_bucket", None, 409), StoreErrorKind::AlreadyExists);
        assert_eq!(kind_for("create_bucket", Some("OperationAborted"), 409), StoreErrorKind::Fatal);
        assert_eq!(kind_for("delete_bucket", Some("BucketNotEmpty"), 409), StoreErrorKind::Fatal);
    }

    #[test]
    fn ranges_are_inclusive_and_whole_reads_omit_the_header() {
        assert_eq!(range_header(0, None).unwrap(), None);
        assert_eq!(range_header(10, None).unwrap().as_deref(), Some("bytes=10-"));
        assert_eq!(range_header(10, Some(5)).unwrap().as_deref(), Some("bytes=10-14"));
        assert!(range_header(0, Some(0)).is_err());
    }

    #[test]
    fn total_size_comes_from_content_range() {
        assert_eq!(total_from_content_range("bytes 0-99/1000"), Some(1000));
        assert_eq!(total_from_content_range("bytes */1000"), Some(1000));
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[test]
    fn part_numbers_are_one_based_and_bounded() {
        assert_eq!(part_number(&BlockId::from_index(0)).unwrap(), 1);
        assert_eq!(part_number(&BlockId::from_index(9_999)).unwrap(), 10_000);
        assert!(part_number(&BlockId::from_index(10_000)).is_err());
    }

    #[test]
    fn s3_capabilities_raise_small_blocks_to_the_part_minimum() {
        let caps = StoreCapabilities::basic().with_block_limits(
            Some(S3_MIN_PART_SIZE),
            Some(S3_MAX_PART_SIZE),
            Some(S3_MAX_PARTS),
        );
        assert_eq!(caps.effective_block_size(4 * 1024 * 1024), S3_MIN_PART_SIZE);
    }
}
