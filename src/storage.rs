//! Object storage layer
//!
//! Stores user files in a Wasabi bucket through the S3 API and hands out
//! presigned links. Large files go through a multipart upload with a bounded
//! number of parts in flight.

use crate::config::{Settings, TransferConfig};
use crate::transfer::TransferProgress;
use crate::utils::{content_type_for, sanitize_filename};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// S3 refuses multipart uploads with more parts than this.
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The object does not exist
    #[error("object not found: {0}")]
    NotFound(String),
    /// Credentials were rejected or lack permission
    #[error("access denied")]
    AccessDenied,
    /// The configured bucket does not exist
    #[error("bucket does not exist")]
    NoSuchBucket,
    /// Any other SDK failure
    #[error("S3 error: {0}")]
    Sdk(String),
    /// Presigned URL could not be generated
    #[error("presign error: {0}")]
    Presign(String),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Short sentence suitable for a chat reply
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(_) => "❌ File not found in storage.".to_string(),
            Self::AccessDenied => "❌ Access denied. Check the storage credentials.".to_string(),
            Self::NoSuchBucket => "❌ The storage bucket does not exist.".to_string(),
            Self::Presign(_) => "❌ Could not generate a download link.".to_string(),
            Self::Io(_) => "❌ Local file error while transferring.".to_string(),
            Self::Sdk(_) | Self::Config(_) => "❌ Storage error. Please try again later.".to_string(),
        }
    }
}

/// Maps an error chain to a chat reply, preferring a storage classification.
#[must_use]
pub fn user_message(err: &anyhow::Error) -> String {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StorageError>())
        .map_or_else(
            || format!("❌ Error: {}", crate::utils::truncate_str(err.to_string(), 300)),
            StorageError::user_message,
        )
}

/// Turns an SDK failure into a [`StorageError`] by status code and error code.
fn classify<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(service_err) = &err {
        let status = service_err.raw().status().as_u16();
        let code = service_err.err().code().unwrap_or_default();
        match (status, code) {
            (_, "NoSuchBucket") => return StorageError::NoSuchBucket,
            (404, _) | (_, "NoSuchKey" | "NotFound") => {
                return StorageError::NotFound(key.to_string())
            }
            (403, _) | (_, "AccessDenied") => return StorageError::AccessDenied,
            _ => {}
        }
    }
    StorageError::Sdk(DisplayErrorContext(&err).to_string())
}

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Streaming body of an object plus the headers needed to proxy it
#[derive(Debug)]
pub struct ObjectStream {
    pub body: ByteStream,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub content_range: Option<String>,
    pub accept_ranges: Option<String>,
}

/// Interface for storage providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), StorageError>;
    /// Upload a local file, adding uploaded bytes to `progress`
    async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<(), StorageError>;
    /// Download an object into a local file, adding received bytes to `progress`
    async fn download_file(
        &self,
        key: &str,
        path: &Path,
        progress: Arc<TransferProgress>,
    ) -> Result<u64, StorageError>;
    /// Object metadata
    async fn head_object(&self, key: &str) -> Result<ObjectInfo, StorageError>;
    /// All objects under a prefix
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;
    /// Presigned GET URL for `key` valid for `expires`
    async fn presigned_url(&self, key: &str, expires: Duration) -> Result<String, StorageError>;
    /// Open an object for streaming, optionally limited to an HTTP range
    async fn open_stream(
        &self,
        key: &str,
        range: Option<String>,
    ) -> Result<ObjectStream, StorageError>;
    /// Delete an object
    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
    /// Abort multipart uploads under the user prefixes started before `before`
    async fn abort_stale_uploads(&self, before: SystemTime) -> Result<usize, StorageError>;
}

/// Common prefix of every key this bot writes
pub const USER_KEY_PREFIX: &str = "user_";

/// An unfinished multipart upload is stale when it belongs to this bot and
/// was started before `before`. Uploads without a start time are left alone.
#[must_use]
pub fn is_stale_upload(key: &str, initiated: Option<SystemTime>, before: SystemTime) -> bool {
    key.starts_with(USER_KEY_PREFIX) && initiated.is_some_and(|t| t < before)
}

/// Prefix under which all objects of a user live
#[must_use]
pub fn user_prefix(user_id: i64) -> String {
    format!("{USER_KEY_PREFIX}{user_id}/")
}

/// Object key for a file uploaded by `user_id`
#[must_use]
pub fn user_object_key(user_id: i64, file_name: &str) -> String {
    format!("{}{}", user_prefix(user_id), sanitize_filename(file_name))
}

/// File name part of a key, without the user folder
#[must_use]
pub fn display_name(key: &str) -> &str {
    match key.split_once('/') {
        Some((folder, rest)) if folder.starts_with("user_") => rest,
        _ => key,
    }
}

/// One part of a multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    pub number: i32,
    pub offset: u64,
    pub length: u64,
}

/// Splits `size` bytes into parts of `chunk_size`, growing the part size
/// when the file would need more than [`MAX_MULTIPART_PARTS`] parts.
#[must_use]
pub fn plan_parts(size: u64, chunk_size: u64) -> Vec<PartSpec> {
    let chunk = chunk_size.max(1).max(size.div_ceil(MAX_MULTIPART_PARTS));
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let length = chunk.min(size - offset);
        parts.push(PartSpec {
            number,
            offset,
            length,
        });
        offset += length;
        number += 1;
    }
    parts
}

/// Wasabi-backed storage implementation
pub struct WasabiStorage {
    client: Client,
    bucket: String,
    transfer: TransferConfig,
}

impl WasabiStorage {
    /// Create a new Wasabi storage instance
    ///
    /// # Errors
    ///
    /// Returns an error if Wasabi configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StorageError> {
        let access_key = settings
            .wasabi_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("WASABI_ACCESS_KEY is missing".into()))?;
        let secret_key = settings
            .wasabi_secret_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("WASABI_SECRET_KEY is missing".into()))?;
        let bucket = settings
            .wasabi_bucket
            .as_ref()
            .ok_or_else(|| StorageError::Config("WASABI_BUCKET is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "wasabi");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(settings.wasabi_region.clone()))
            .retry_config(RetryConfig::adaptive().with_max_attempts(settings.max_attempts.max(1)))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .read_timeout(READ_TIMEOUT)
                    .build(),
            )
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(settings.endpoint_url())
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            transfer: settings.transfer_config(),
        })
    }

    /// Bucket this storage writes to
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_single(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(i64::try_from(size).unwrap_or(i64::MAX))
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
        progress: &TransferProgress,
    ) -> Result<(), StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Sdk("CreateMultipartUpload returned no upload id".into()))?
            .to_string();

        let result = match self.upload_parts(path, key, &upload_id, size, progress).await {
            Ok(parts) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify(e, key)),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!(key = %key, upload_id = %upload_id, error = %e, "Multipart upload failed, aborting");
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key = %key, error = %DisplayErrorContext(&abort_err), "Failed to abort multipart upload");
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
        progress: &TransferProgress,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let plan = plan_parts(size, self.transfer.chunk_size);
        debug!(key = %key, parts = plan.len(), "Uploading parts");

        let mut parts: Vec<CompletedPart> = stream::iter(plan)
            .map(|part| async move {
                let body = ByteStream::read_from()
                    .path(path)
                    .offset(part.offset)
                    .length(Length::Exact(part.length))
                    .build()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

                let output = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part.number)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| classify(e, key))?;

                progress.add(part.length);

                Ok::<_, StorageError>(
                    CompletedPart::builder()
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .part_number(part.number)
                        .build(),
                )
            })
            .buffer_unordered(self.transfer.max_concurrency)
            .try_collect()
            .await?;

        parts.sort_by_key(CompletedPart::part_number);
        Ok(parts)
    }
}

#[async_trait]
impl StorageProvider for WasabiStorage {
    async fn check_connection(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| match classify(e, &self.bucket) {
                // HeadBucket has no body, so a missing bucket is a bare 404
                StorageError::NotFound(_) => StorageError::NoSuchBucket,
                other => other,
            })?;
        Ok(())
    }

    async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        progress: Arc<TransferProgress>,
    ) -> Result<(), StorageError> {
        let size = tokio::fs::metadata(path).await?.len();
        let content_type = content_type_for(key);

        if size < self.transfer.multipart_threshold {
            self.put_single(path, key, size, &content_type).await?;
            progress.add(size);
        } else {
            self.put_multipart(path, key, size, &content_type, &progress)
                .await?;
        }

        info!(key = %key, size = size, "Uploaded object");
        Ok(())
    }

    async fn download_file(
        &self,
        key: &str,
        path: &Path,
        progress: Arc<TransferProgress>,
    ) -> Result<u64, StorageError> {
        let mut output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0_u64;
        while let Some(chunk) = output
            .body
            .try_next()
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.add(chunk.len() as u64);
        }
        file.flush().await?;

        info!(key = %key, size = written, "Downloaded object");
        Ok(written)
    }

    async fn head_object(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size: non_negative(output.content_length()),
            content_type: output.content_type().map(str::to_string),
            last_modified: output.last_modified().and_then(to_chrono),
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(e, prefix))?;

            objects.extend(output.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectInfo {
                    key: key.to_string(),
                    size: non_negative(obj.size()),
                    content_type: None,
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            }));

            match (output.is_truncated(), output.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn presigned_url(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        let presigning =
            PresigningConfig::expires_in(expires).map_err(|e| StorageError::Presign(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn open_stream(
        &self,
        key: &str,
        range: Option<String>,
    ) -> Result<ObjectStream, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(ObjectStream {
            content_length: output.content_length().and_then(|l| u64::try_from(l).ok()),
            content_type: output.content_type().map(str::to_string),
            content_range: output.content_range().map(str::to_string),
            accept_ranges: output.accept_ranges().map(str::to_string),
            body: output.body,
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        info!(key = %key, "Deleted object");
        Ok(())
    }

    async fn abort_stale_uploads(&self, before: SystemTime) -> Result<usize, StorageError> {
        let mut aborted = 0;
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let page = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(USER_KEY_PREFIX)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(|e| classify(e, &self.bucket))?;

            for upload in page.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                    continue;
                };
                let initiated = upload.initiated().and_then(|t| SystemTime::try_from(*t).ok());
                if !is_stale_upload(key, initiated, before) {
                    continue;
                }
                match self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    Ok(_) => {
                        info!(key = %key, upload_id = %upload_id, "Aborted stale multipart upload");
                        aborted += 1;
                    }
                    Err(e) => warn!(key = %key, error = %DisplayErrorContext(&e), "Failed to abort stale multipart upload"),
                }
            }

            if page.is_truncated() != Some(true) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_string);
            upload_id_marker = page.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }
        Ok(aborted)
    }
}

fn non_negative(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_uploads_are_ours_and_older_than_cutoff() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let earlier = Some(start - Duration::from_secs(60));
        let later = Some(start + Duration::from_secs(60));

        assert!(is_stale_upload("user_1/big.iso", earlier, start));
        assert!(!is_stale_upload("user_1/big.iso", later, start));
        assert!(!is_stale_upload("user_1/big.iso", None, start));
        assert!(!is_stale_upload("backups/db.tar", earlier, start));
    }

    #[test]
    fn test_user_keys() {
        assert_eq!(user_prefix(42), "user_42/");
        assert_eq!(user_object_key(42, "my file?.pdf"), "user_42/my file_.pdf");
        assert_eq!(display_name("user_42/my file_.pdf"), "my file_.pdf");
        assert_eq!(display_name("loose.txt"), "loose.txt");
    }

    #[test]
    fn test_plan_parts_splits_with_short_tail() {
        let mib = 1024 * 1024;
        let parts = plan_parts(20 * mib, 8 * mib);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], PartSpec { number: 1, offset: 0, length: 8 * mib });
        assert_eq!(parts[2].number, 3);
        assert_eq!(parts[2].offset, 16 * mib);
        assert_eq!(parts[2].length, 4 * mib);
        assert_eq!(parts.iter().map(|p| p.length).sum::<u64>(), 20 * mib);
    }

    #[test]
    fn test_plan_parts_exact_multiple_and_part_cap() {
        let parts = plan_parts(16, 8);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].length, 8);

        let parts = plan_parts(MAX_MULTIPART_PARTS * 10 + 1, 1);
        assert!(parts.len() as u64 <= MAX_MULTIPART_PARTS);
        assert!(plan_parts(0, 8).is_empty());
    }

    #[test]
    fn test_user_message_prefers_storage_error() {
        let err = anyhow::Error::new(StorageError::NotFound("user_1/a.txt".into()))
            .context("download failed");
        assert!(user_message(&err).contains("not found"));

        let err = anyhow::anyhow!("boom");
        assert_eq!(user_message(&err), "❌ Error: boom");
    }

    #[tokio::test]
    async fn test_missing_credentials_is_config_error() {
        let mut settings = crate::config::test_settings();
        settings.wasabi_bucket = None;
        let result = WasabiStorage::new(&settings).await;
        assert!(matches!(result, Err(StorageError::Config(_))));
    }
}
