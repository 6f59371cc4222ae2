//! S3-compatible object store (MinIO and friends), usable as both source and destination.

use crate::prelude::*;

use crate::ops::interface::*;
use crate::settings::ObjectStoreSettings;
use crate::utils::retryable::{self, RetryOptions};
use crate::utils::slow_warn::{SLOW_CALL_THRESHOLD, warn_if_slow};
use async_stream::try_stream;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Object};
use bytes::{Bytes, BytesMut};
use std::future::Future;

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 64 << 20;
pub const DEFAULT_PART_SIZE: u64 = 16 << 20;

const LIST_PAGE_SIZE: i32 = 1000;
const MAX_PARTS: u64 = 10_000;
const MIN_PART_SIZE: u64 = 5 << 20;

// ============================================================================
// Transfer planning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    /// Multipart upload whose parts are copied by the server from the source object.
    ServerSideCopy,
    /// Multipart upload fed from the source byte stream.
    MultipartStream,
    /// One request (or one local write) fed from the source byte stream.
    DirectStream,
}

pub fn plan_transfer(
    size: u64,
    threshold: u64,
    same_endpoint: bool,
    destination: DestinationKind,
) -> TransferPlan {
    match destination {
        DestinationKind::LocalPath => TransferPlan::DirectStream,
        DestinationKind::ObjectStore if size < threshold => TransferPlan::DirectStream,
        DestinationKind::ObjectStore if same_endpoint => TransferPlan::ServerSideCopy,
        DestinationKind::ObjectStore => TransferPlan::MultipartStream,
    }
}

/// Part size actually used for an object of `size` bytes: the configured size, grown when the
/// object would otherwise need more parts than a multipart upload allows.
pub fn effective_part_size(size: u64, configured: u64) -> u64 {
    configured.max(MIN_PART_SIZE).max(size.div_ceil(MAX_PARTS))
}

/// Inclusive byte ranges covering `size` bytes in `part_size` steps.
pub fn part_ranges(size: u64, part_size: u64) -> Vec<(u64, u64)> {
    let part_size = part_size.max(1);
    (0..size)
        .step_by(part_size as usize)
        .map(|start| (start, (start + part_size).min(size) - 1))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub retry: RetryOptions,
    pub multipart_threshold: u64,
    pub part_size: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

// ============================================================================
// Error classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    NotFound,
    Transient,
    Permanent,
}

fn classify_status(status: u16, code: Option<&str>) -> ErrorClass {
    match code {
        Some("NoSuchBucket" | "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
            return ErrorClass::Permanent;
        }
        Some("NoSuchKey" | "NotFound") => return ErrorClass::NotFound,
        Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable") => {
            return ErrorClass::Transient;
        }
        _ => {}
    }
    match status {
        404 => ErrorClass::NotFound,
        408 | 429 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

fn classify_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let class = match &err {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => ErrorClass::Transient,
        SdkError::DispatchFailure(failure) if failure.is_timeout() || failure.is_io() => {
            ErrorClass::Transient
        }
        SdkError::ServiceError(service) => {
            classify_status(service.raw().status().as_u16(), service.err().code())
        }
        _ => ErrorClass::Permanent,
    };
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    match class {
        ErrorClass::NotFound => StorageError::NotFound(message),
        ErrorClass::Transient => StorageError::Transient(message),
        ErrorClass::Permanent => StorageError::Permanent(message),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Adds a scheme to bare `host:port` endpoints.
pub fn endpoint_url(endpoint: &str, use_ssl: bool) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let scheme = if use_ssl { "https" } else { "http" };
        format!("{scheme}://{endpoint}")
    }
}

/// `x-amz-copy-source` value: bucket and URL-encoded key, `/` kept between key segments.
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    format!("{bucket}/{}", encoded.join("/"))
}

fn object_metadata(object: &Object) -> Option<ObjectMetadata> {
    let path = object.key()?;
    if path.ends_with('/') {
        return None;
    }
    let last_modified = object
        .last_modified()
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_default();
    Some(ObjectMetadata {
        path: path.to_string(),
        size: object.size().unwrap_or(0).max(0) as u64,
        fingerprint: object.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        last_modified,
    })
}

fn byte_stream_body(body: ByteStream) -> BoxStream<'static, StorageResult<Bytes>> {
    futures::stream::unfold(body, |mut body| async move {
        let chunk = body.next().await?;
        let chunk = chunk.map_err(|e| StorageError::transient(format!("read object body: {e}")));
        Some((chunk, body))
    })
    .boxed()
}

// ============================================================================
// Store
// ============================================================================

pub struct S3Store {
    client: Client,
    bucket: String,
    location: ObjectLocation,
    options: TransferOptions,
}

impl S3Store {
    pub async fn connect(settings: &ObjectStoreSettings, options: TransferOptions) -> Result<Self> {
        if settings.bucket.is_empty() {
            bail!("bucket name is empty for endpoint `{}`", settings.endpoint);
        }
        let endpoint = endpoint_url(&settings.endpoint, settings.use_ssl);
        let credentials = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "bucketsync",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        debug!("connected to s3 endpoint {endpoint}, bucket {}", settings.bucket);
        Ok(Self {
            client: Client::from_conf(config),
            bucket: settings.bucket.clone(),
            location: ObjectLocation {
                endpoint,
                bucket: settings.bucket.clone(),
            },
            options,
        })
    }

    /// Every remote call goes through here: retried per the transfer options, reported while
    /// it is slow, and abandoned once `cancel` fires.
    async fn call<T, F, Fut>(&self, what: String, cancel: &CancellationToken, op: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let describe = || what.clone();
        warn_if_slow(
            &describe,
            SLOW_CALL_THRESHOLD,
            retryable::run(&what, op, &self.options.retry, cancel),
        )
        .await
    }

    /// Single-request upload. The body is held in memory so a retried attempt can resend it;
    /// `put` only takes this path below the multipart threshold, which bounds the buffer.
    async fn put_buffered(
        &self,
        path: &str,
        stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let data = stream.collect(cancel).await?;
        let len = data.len() as u64;
        self.call(format!("put s3://{}/{path}", self.bucket), cancel, || async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(path)
                .content_length(len as i64)
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| classify_sdk_error(&format!("put {path}"), e))
        })
        .await?;
        Ok(len)
    }

    async fn create_multipart(&self, path: &str, cancel: &CancellationToken) -> StorageResult<String> {
        let output = self
            .call(format!("create multipart upload for {path}"), cancel, || async {
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(path)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(&format!("create multipart upload {path}"), e))
            })
            .await?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::permanent(format!("no upload id returned for {path}")))
    }

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> StorageResult<CompletedPart> {
        let output = self
            .call(format!("upload part {part_number} of {path}"), cancel, || async {
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(path)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .content_length(data.len() as i64)
                    .body(ByteStream::from(data.clone()))
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(&format!("upload part {part_number} of {path}"), e))
            })
            .await?;
        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn upload_parts(
        &self,
        path: &str,
        upload_id: &str,
        stream: &mut ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<(Vec<CompletedPart>, u64)> {
        let part_size = effective_part_size(stream.size, self.options.part_size) as usize;
        let mut parts = Vec::new();
        let mut buf = BytesMut::with_capacity(part_size);
        let mut written: u64 = 0;
        loop {
            let chunk = stream.next_chunk(cancel).await?;
            let done = chunk.is_none();
            if let Some(chunk) = chunk {
                written += chunk.len() as u64;
                buf.extend_from_slice(&chunk);
            }
            while buf.len() >= part_size || (done && !buf.is_empty()) {
                let data = buf.split_to(buf.len().min(part_size)).freeze();
                let part_number = parts.len() as i32 + 1;
                parts.push(self.upload_part(path, upload_id, part_number, data, cancel).await?);
            }
            if done {
                break;
            }
        }
        check_length(written, stream.size)?;
        Ok((parts, written))
    }

    /// Completes the upload on success, aborts it otherwise so no orphaned parts linger.
    async fn finish_multipart(
        &self,
        path: &str,
        upload_id: &str,
        result: StorageResult<(Vec<CompletedPart>, u64)>,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let result = match result {
            Ok((parts, written)) => self
                .complete_multipart(path, upload_id, parts, cancel)
                .await
                .map(|()| written),
            Err(err) => Err(err),
        };
        if result.is_err() {
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(path)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(
                    "failed to abort multipart upload of {path}: {}",
                    DisplayErrorContext(&abort_err)
                );
            }
        }
        result
    }

    async fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.call(format!("complete multipart upload of {path}"), cancel, || async {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(path)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts.clone()))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| classify_sdk_error(&format!("complete multipart upload {path}"), e))
        })
        .await?;
        Ok(())
    }

    async fn upload_multipart(
        &self,
        path: &str,
        mut stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let upload_id = self.create_multipart(path, cancel).await?;
        let result = self.upload_parts(path, &upload_id, &mut stream, cancel).await;
        self.finish_multipart(path, &upload_id, result, cancel).await
    }

    async fn server_side_copy(
        &self,
        source: &ObjectLocation,
        source_path: &str,
        path: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let part_size = effective_part_size(size, self.options.part_size);
        let copy_source = copy_source(&source.bucket, source_path);
        let upload_id = self.create_multipart(path, cancel).await?;
        let result: StorageResult<(Vec<CompletedPart>, u64)> = async {
            let mut parts = Vec::new();
            for (idx, (start, end)) in part_ranges(size, part_size).into_iter().enumerate() {
                let part_number = idx as i32 + 1;
                let output = self
                    .call(format!("copy part {part_number} of {path}"), cancel, || async {
                        self.client
                            .upload_part_copy()
                            .bucket(&self.bucket)
                            .key(path)
                            .upload_id(&upload_id)
                            .part_number(part_number)
                            .copy_source(&copy_source)
                            .copy_source_range(format!("bytes={start}-{end}"))
                            .send()
                            .await
                            .map_err(|e| {
                                classify_sdk_error(&format!("copy part {part_number} of {path}"), e)
                            })
                    })
                    .await?;
                let e_tag = output
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .map(str::to_string);
                parts.push(
                    CompletedPart::builder()
                        .set_e_tag(e_tag)
                        .part_number(part_number)
                        .build(),
                );
            }
            Ok((parts, size))
        }
        .await;
        self.finish_multipart(path, &upload_id, result, cancel).await
    }
}

#[async_trait]
impl ObjectSource for S3Store {
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxStream<'a, StorageResult<Vec<ObjectMetadata>>> {
        try_stream! {
            let mut continuation: Option<String> = None;
            loop {
                let token = continuation.clone();
                let page = self
                    .call(format!("list s3://{}/{prefix}", self.bucket), cancel, || {
                        let token = token.clone();
                        async move {
                            self.client
                                .list_objects_v2()
                                .bucket(&self.bucket)
                                .prefix(prefix)
                                .max_keys(LIST_PAGE_SIZE)
                                .set_continuation_token(token)
                                .send()
                                .await
                                .map_err(|e| classify_sdk_error(&format!("list {prefix}"), e))
                        }
                    })
                    .await?;
                let batch: Vec<ObjectMetadata> =
                    page.contents().iter().filter_map(object_metadata).collect();
                trace!("listed {} objects under {prefix}", batch.len());
                if !batch.is_empty() {
                    yield batch;
                }
                match page.next_continuation_token() {
                    Some(token) if page.is_truncated().unwrap_or(false) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
        }
        .boxed()
    }

    async fn fetch(&self, path: &str, cancel: &CancellationToken) -> StorageResult<ObjectStream> {
        let output = self
            .call(format!("get s3://{}/{path}", self.bucket), cancel, || async {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(path)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(&format!("get {path}"), e))
            })
            .await?;
        Ok(ObjectStream {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            body: byte_stream_body(output.body),
        })
    }

    fn location(&self) -> Option<&ObjectLocation> {
        Some(&self.location)
    }
}

#[async_trait]
impl ObjectDestination for S3Store {
    fn kind(&self) -> DestinationKind {
        DestinationKind::ObjectStore
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        let result = self
            .call(format!("head s3://{}/{path}", self.bucket), cancel, || async {
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(path)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(&format!("head {path}"), e))
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn put(
        &self,
        path: &str,
        stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        match plan_transfer(
            stream.size,
            self.options.multipart_threshold,
            false,
            DestinationKind::ObjectStore,
        ) {
            TransferPlan::MultipartStream => self.upload_multipart(path, stream, cancel).await,
            _ => self.put_buffered(path, stream, cancel).await,
        }
    }

    async fn copy_from(
        &self,
        source: &dyn ObjectSource,
        source_path: &str,
        path: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let same_endpoint = source
            .location()
            .filter(|loc| loc.endpoint == self.location.endpoint);
        let plan = plan_transfer(
            size,
            self.options.multipart_threshold,
            same_endpoint.is_some(),
            DestinationKind::ObjectStore,
        );
        debug!("copying {source_path} -> {path} ({size} bytes) via {plan:?}");
        match (plan, same_endpoint) {
            (TransferPlan::ServerSideCopy, Some(location)) => {
                self.server_side_copy(location, source_path, path, size, cancel)
                    .await
            }
            _ => {
                let mut stream = source.fetch(source_path, cancel).await?;
                stream.size = size;
                self.put(path, stream, cancel).await
            }
        }
    }
}
