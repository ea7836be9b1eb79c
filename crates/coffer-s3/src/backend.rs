use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use coffer_core::{
    BucketError, Connection, ListPage, ObjectBackend, ObjectMeta, ObjectReader, ObjectWriter,
    Result,
};
use tracing::{debug, instrument, warn};

use crate::config::S3Config;

/// Maximum retries for transient errors (429 / 5xx).
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;
/// Buffered bytes that trigger a multipart upload, also the size of each part.
/// S3 requires at least 5 MiB for every part except the last.
const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;
/// Objects requested per listing page.
const DEFAULT_PAGE_SIZE: i32 = 1000;

/// Backend over an S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3Backend {
    connection: Connection<S3Client>,
    bucket: String,
    page_size: i32,
    part_size: usize,
}

impl S3Backend {
    /// Build a client from `config`.
    pub async fn connect(config: &S3Config) -> Result<Self> {
        config.validate()?;
        let region = Region::new(config.region().to_string());

        let client = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                let credentials =
                    Credentials::new(access_key_id, secret_access_key, None, None, "coffer");
                let mut builder = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(region)
                    .retry_config(RetryConfig::disabled())
                    .force_path_style(config.force_path_style);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }
                S3Client::from_conf(builder.build())
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared)
                    .retry_config(RetryConfig::disabled())
                    .force_path_style(config.force_path_style);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }
                S3Client::from_conf(builder.build())
            }
        };

        debug!(
            "S3 client ready for bucket {} (region {}, endpoint {:?})",
            config.bucket,
            config.region(),
            config.endpoint
        );
        Ok(Self::from_client(client, config.bucket.clone()))
    }

    /// Use an existing client. Retries of transient failures happen in this backend, so the
    /// client should be built with [`RetryConfig::disabled`].
    pub fn from_client(client: S3Client, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self::with_connection(Connection::new(format!("s3://{}", bucket), client), bucket)
    }

    /// Share the client of another S3 backend, possibly for a different S3 bucket.
    pub fn with_connection(connection: Connection<S3Client>, bucket: impl Into<String>) -> Self {
        Self {
            connection,
            bucket: bucket.into(),
            page_size: DEFAULT_PAGE_SIZE,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Part size of multipart uploads. Objects up to this size go up in one request.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn not_found(&self, path: &str) -> BucketError {
        BucketError::NotFound {
            bucket: self.bucket.clone(),
            key: path.to_string(),
        }
    }
}

// =========================================================================
// Retry helper
// =========================================================================

/// Sleep with exponential backoff + jitter.
async fn backoff_sleep(attempt: u32) {
    let base = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt));
    let jitter = Duration::from_millis(rand_jitter());
    tokio::time::sleep(base + jitter).await;
}

/// Check if an S3 error is retryable (429 or 5xx).
fn is_retryable_s3_error<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::ServiceError(e) => is_retryable_status(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => is_retryable_status(e.raw().status().as_u16()),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        _ => false,
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=504).contains(&status)
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 50)
        .unwrap_or(0)
}

/// Run an S3 request, retrying transient failures.
async fn with_retry<T, E, F, Fut>(
    operation: &'static str,
    key: &str,
    mut request: F,
) -> std::result::Result<T, SdkError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, SdkError<E>>>,
{
    let mut attempt = 0;
    loop {
        match request().await {
            Err(e) if attempt < MAX_RETRIES && is_retryable_s3_error(&e) => {
                warn!(attempt, key, "S3 {} retryable error, retrying", operation);
                backoff_sleep(attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn s3_error(operation: &str, err: impl std::error::Error + 'static) -> BucketError {
    BucketError::backend("s3", format!("{} error: {}", operation, DisplayErrorContext(err)))
}

/// Checksum from an ETag. Multipart ETags (`"<md5>-<parts>"`) are not content hashes.
fn etag_checksum(etag: Option<&str>) -> Option<String> {
    let tag = etag?.trim_matches('"');
    if tag.is_empty() || tag.contains('-') {
        return None;
    }
    Some(tag.to_ascii_lowercase())
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

// =========================================================================
// Writer
// =========================================================================

/// Uploads an object on close, switching to a multipart upload once more than one
/// part worth of bytes has been written.
///
/// A multipart upload that is never completed is aborted, so no object appears.
struct S3Writer {
    client: S3Client,
    bucket: String,
    key: String,
    part_size: usize,
    buffer: Vec<u8>,
    upload: Option<MultipartUpload>,
    closed: bool,
}

struct MultipartUpload {
    id: String,
    parts: Vec<CompletedPart>,
}

impl S3Writer {
    fn new(client: S3Client, bucket: String, key: String, part_size: usize) -> Self {
        Self {
            client,
            bucket,
            key,
            part_size,
            buffer: Vec::new(),
            upload: None,
            closed: false,
        }
    }

    async fn start_multipart(&self) -> Result<MultipartUpload> {
        let output = with_retry("create_multipart_upload", &self.key, || {
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .send()
        })
        .await
        .map_err(|e| s3_error("create_multipart_upload", e))?;

        let id = output
            .upload_id()
            .ok_or_else(|| BucketError::backend("s3", "multipart upload started without an id"))?
            .to_string();
        debug!("Started multipart upload {} for s3://{}/{}", id, self.bucket, self.key);
        Ok(MultipartUpload {
            id,
            parts: Vec::new(),
        })
    }

    /// Upload `body` as the next part of the current multipart upload.
    async fn upload_part(&mut self, body: Bytes) -> Result<()> {
        let Some(upload) = self.upload.as_mut() else {
            return Err(BucketError::backend("s3", "no multipart upload in progress"));
        };
        let part_number = upload.parts.len() as i32 + 1;
        let output = with_retry("upload_part", &self.key, || {
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&upload.id)
                .part_number(part_number)
                .body(ByteStream::from(body.clone()))
                .send()
        })
        .await
        .map_err(|e| s3_error("upload_part", e))?;

        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn flush_parts(&mut self) -> Result<()> {
        while self.buffer.len() > self.part_size {
            if self.upload.is_none() {
                self.upload = Some(self.start_multipart().await?);
            }
            let rest = self.buffer.split_off(self.part_size);
            let part = Bytes::from(std::mem::replace(&mut self.buffer, rest));
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn put_whole(&mut self) -> Result<()> {
        let body = Bytes::from(std::mem::take(&mut self.buffer));
        let len = body.len();
        with_retry("put_object", &self.key, || {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(body.clone()))
                .send()
        })
        .await
        .map_err(|e| s3_error("put_object", e))?;

        debug!("Uploaded {} bytes to s3://{}/{}", len, self.bucket, self.key);
        Ok(())
    }

    async fn complete_multipart(&mut self) -> Result<()> {
        let last = Bytes::from(std::mem::take(&mut self.buffer));
        if !last.is_empty() {
            self.upload_part(last).await?;
        }
        let Some(upload) = self.upload.as_ref() else {
            return Err(BucketError::backend("s3", "no multipart upload in progress"));
        };
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(upload.parts.clone()))
            .build();
        with_retry("complete_multipart_upload", &self.key, || {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&upload.id)
                .multipart_upload(completed.clone())
                .send()
        })
        .await
        .map_err(|e| s3_error("complete_multipart_upload", e))?;

        debug!(
            "Completed multipart upload of {} parts to s3://{}/{}",
            upload.parts.len(),
            self.bucket,
            self.key
        );
        self.upload = None;
        Ok(())
    }

    /// Abort an unfinished multipart upload in the background.
    fn abort_multipart(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to abort multipart upload {} of {}", upload.id, self.key);
            return;
        };
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        runtime.spawn(async move {
            let result = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload.id)
                .send()
                .await;
            if let Err(e) = result {
                warn!(
                    "Failed to abort multipart upload {} of {}: {}",
                    upload.id,
                    key,
                    DisplayErrorContext(e)
                );
            }
        });
    }
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BucketError::backend("s3", "write after close"));
        }
        self.buffer.extend_from_slice(buf);
        self.flush_parts().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(BucketError::backend("s3", "writer already closed"));
        }
        self.closed = true;
        if self.upload.is_none() {
            return self.put_whole().await;
        }
        let result = self.complete_multipart().await;
        if result.is_err() {
            self.abort_multipart();
        }
        result
    }
}

impl Drop for S3Writer {
    fn drop(&mut self) {
        self.abort_multipart();
    }
}

// =========================================================================
// Backend primitives
// =========================================================================

#[async_trait]
impl ObjectBackend for S3Backend {
    type Handle = S3Client;

    fn kind(&self) -> &'static str {
        "s3"
    }

    fn connection(&self) -> &Connection<S3Client> {
        &self.connection
    }

    #[instrument(skip(self, client), level = "debug")]
    async fn ping(&self, client: &S3Client) -> Result<()> {
        // Single attempt: callers own the retry policy for connectivity failures.
        client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
        .map_err(|e| BucketError::Connectivity {
            target: self.connection.target().to_string(),
            message: DisplayErrorContext(e).to_string(),
        })
    }

    #[instrument(skip(self, client), level = "debug")]
    async fn open_reader(&self, client: &S3Client, path: &str) -> Result<ObjectReader> {
        let result = with_retry("get_object", path, || {
            client.get_object().bucket(&self.bucket).key(path).send()
        })
        .await;

        match result {
            Ok(output) => Ok(Box::new(Box::pin(output.body.into_async_read()))),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(self.not_found(path));
                }
                Err(s3_error("get_object", service_error))
            }
        }
    }

    #[instrument(skip(self, client), level = "debug")]
    async fn open_writer(&self, client: &S3Client, path: &str) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(S3Writer::new(
            client.clone(),
            self.bucket.clone(),
            path.to_string(),
            self.part_size,
        )))
    }

    #[instrument(skip(self, client), level = "debug")]
    async fn stat(&self, client: &S3Client, path: &str) -> Result<Option<ObjectMeta>> {
        let result = with_retry("head_object", path, || {
            client.head_object().bucket(&self.bucket).key(path).send()
        })
        .await;

        match result {
            Ok(output) => Ok(Some(ObjectMeta {
                path: path.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                checksum: etag_checksum(output.e_tag()),
                last_modified: output.last_modified().and_then(to_chrono),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Ok(None);
                }
                Err(s3_error("head_object", service_error))
            }
        }
    }

    #[instrument(skip(self, client), level = "debug")]
    async fn delete(&self, client: &S3Client, path: &str) -> Result<()> {
        with_retry("delete_object", path, || {
            client.delete_object().bucket(&self.bucket).key(path).send()
        })
        .await
        .map(|_| ())
        .map_err(|e| s3_error("delete_object", e))
    }

    #[instrument(skip(self, client), level = "debug")]
    async fn list_page(
        &self,
        client: &S3Client,
        prefix: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        let output = with_retry("list_objects_v2", prefix.unwrap_or(""), || {
            let mut request = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .max_keys(self.page_size);
            if let Some(prefix) = prefix {
                request = request.prefix(prefix);
            }
            if let Some(token) = cursor {
                request = request.continuation_token(token);
            }
            request.send()
        })
        .await
        .map_err(|e| s3_error("list_objects_v2", e))?;

        let objects: Vec<ObjectMeta> = output
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectMeta {
                    path: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    checksum: etag_checksum(obj.e_tag()),
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        let next = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        debug!("Listed {} objects in s3://{}", objects.len(), self.bucket);
        Ok(ListPage { objects, next })
    }
}
