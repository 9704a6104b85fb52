/*!
S3 object store built on the official AWS SDK.

Works with AWS S3 and S3-compatible services (a custom endpoint switches to
path-style addressing). Every request runs under the configured operation
deadline and is retried with exponential backoff when the failure is
transient.
*/

use super::{decode_upload_key, staged_len, ObjectReader, ObjectStore, DELETE_BATCH_SIZE};
use crate::config::StorageConfig;
use crate::key::KeyCodec;
use crate::observability::MetricsTimer;
use crate::record::BackupRecord;
use crate::{Result, StashError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use stash_retry::{with_backoff, RetryPolicy};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

/// Object store backed by an S3 bucket
///
/// # Authentication
/// Credentials come from the standard AWS provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
///
/// # Example
/// ```rust,no_run
/// use stash_core::config::StorageConfig;
/// use stash_core::key::{ArchiveFormat, KeyCodec};
/// use stash_core::storage::{ObjectStore, S3ObjectStore};
///
/// # async fn run() -> stash_core::Result<()> {
/// let config = StorageConfig::s3_with_bucket("my-backups");
/// let codec = KeyCodec::new("stash", ArchiveFormat::TarGz);
/// let store = S3ObjectStore::connect(&config, codec).await?;
/// let records = store.list("stash/web/").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    codec: KeyCodec,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl S3ObjectStore {
    /// Build a client from `config` and probe the bucket with `HeadBucket`.
    ///
    /// # Errors
    /// [`StashError::Config`] without a bucket name, and
    /// [`StashError::Connectivity`] if the probe fails or exceeds
    /// `connect_timeout_secs`.
    pub async fn connect(config: &StorageConfig, codec: KeyCodec) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| StashError::config("S3 backend requires a valid bucket name"))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(StashError::connectivity(
                "AWS credentials not found. Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY or configure a profile",
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());
        let store = Self::with_client(client, bucket, codec, config.operation_timeout());
        store.probe(config.connect_timeout()).await?;
        Ok(store)
    }

    /// Wrap an existing client without probing the bucket
    pub fn with_client(
        client: S3Client,
        bucket: impl Into<String>,
        codec: KeyCodec,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            codec,
            retry: RetryPolicy::default(),
            operation_timeout,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn probe(&self, deadline: Duration) -> Result<()> {
        let request = self.client.head_bucket().bucket(&self.bucket).send();
        match tokio::time::timeout(deadline, request).await {
            Ok(Ok(_)) => {
                info!(bucket = %self.bucket, "Connected to S3 bucket");
                Ok(())
            }
            Ok(Err(err)) => Err(StashError::connectivity(format!(
                "cannot access bucket '{}': {}",
                self.bucket,
                DisplayErrorContext(&err)
            ))),
            Err(_) => Err(StashError::connectivity(format!(
                "timed out after {}s reaching bucket '{}'",
                deadline.as_secs(),
                self.bucket
            ))),
        }
    }

    /// Run one S3 request under the operation deadline, with retries.
    async fn call<T, F, Fut>(&self, operation: &'static str, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.operation_timeout;
        with_backoff(operation, &self.retry, |attempt| {
            let timer = MetricsTimer::start(operation);
            if attempt > 1 {
                timer.record_retry();
            }
            let pending = request();
            async move {
                let result = match tokio::time::timeout(deadline, pending).await {
                    Ok(result) => result,
                    Err(_) => Err(StashError::Timeout {
                        operation,
                        seconds: deadline.as_secs(),
                    }),
                };
                match &result {
                    Ok(_) => timer.finish(),
                    Err(_) => timer.finish_with_error(),
                }
                result
            }
        })
        .await
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    async fn put(&self, key: &str, source: &Path) -> Result<BackupRecord> {
        let decoded = decode_upload_key(&self.codec, key)?;
        let size = staged_len(source).await?;
        debug!(bucket = %self.bucket, key = %key, size, "Starting S3 put_object operation");

        let output = self
            .call("put_object", || async {
                let body = ByteStream::from_path(source)
                    .await
                    .map_err(|e| {
                        StashError::storage(format!("failed to read staged archive: {e}"))
                    })?;
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| map_s3_error("put_object", e, key))
            })
            .await
            .inspect_err(|err| {
                error!(
                    bucket = %self.bucket,
                    key = %key,
                    error = %err,
                    "Failed to upload archive to S3"
                )
            })?;

        Ok(BackupRecord::from_decoded(key, decoded, size, output.e_tag().map(str::to_string)))
    }

    async fn get(&self, key: &str) -> Result<ObjectReader> {
        let output = self
            .call("get_object", || async {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| map_s3_error("get_object", e, key))
            })
            .await?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupRecord>> {
        self.call("list_objects", || async {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .into_paginator()
                .send();

            let mut records = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| map_s3_error("list_objects", e, prefix))?;
                for object in page.contents() {
                    let Some(key) = object.key() else {
                        continue;
                    };
                    let Some(decoded) = self.codec.decode(key) else {
                        debug!(key = %key, "Ignoring foreign object");
                        continue;
                    };
                    let size = u64::try_from(object.size().unwrap_or(0)).unwrap_or(0);
                    let etag = object.e_tag().map(str::to_string);
                    records.push(BackupRecord::from_decoded(key, decoded, size, etag));
                }
            }
            records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            Ok(records)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.call("delete_object", || async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_s3_error("delete_object", e, key))
        })
        .await?;
        debug!(bucket = %self.bucket, key = %key, "Deleted archive from S3");
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut failed = Vec::new();

        for delete in delete_requests(keys)? {
            let output = self
                .call("delete_objects", || async {
                    self.client
                        .delete_objects()
                        .bucket(&self.bucket)
                        .delete(delete.clone())
                        .send()
                        .await
                        .map_err(|e| map_s3_error("delete_objects", e, ""))
                })
                .await?;

            for err in output.errors() {
                failed.push(format!(
                    "{} ({})",
                    err.key().unwrap_or("<unknown key>"),
                    err.message().or(err.code()).unwrap_or("unknown error")
                ));
            }
            debug!(bucket = %self.bucket, batch = delete.objects().len(), "Deleted batch from S3");
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StashError::storage(format!(
                "failed to delete {} of {} objects: {}",
                failed.len(),
                keys.len(),
                failed.join(", ")
            )))
        }
    }
}

/// Quiet multi-object delete requests of at most [`DELETE_BATCH_SIZE`] keys
fn delete_requests(keys: &[String]) -> Result<Vec<Delete>> {
    keys.chunks(DELETE_BATCH_SIZE)
        .map(|batch| {
            let objects = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder().key(key).build().map_err(|e| {
                        StashError::storage(format!("invalid delete request for '{key}': {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StashError::storage(format!("invalid delete request: {e}")))
        })
        .collect()
}

/// Map AWS SDK errors to StashError with appropriate context
fn map_s3_error<E>(op: &str, error: SdkError<E>, key: &str) -> StashError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &error {
        SdkError::DispatchFailure(_) => {
            StashError::network(format!(
                "S3 {op} request failed to dispatch: {}",
                DisplayErrorContext(&error)
            ))
        }
        SdkError::TimeoutError(_) => {
            StashError::network(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(_) => {
            StashError::network(format!("S3 {op} response error: {}", DisplayErrorContext(&error)))
        }
        SdkError::ServiceError(service_err) => classify_service_error(
            op,
            key,
            service_err.err().code(),
            service_err.raw().status().as_u16(),
            service_err.err().message(),
        ),
        _ => StashError::storage(format!("S3 {op} error: {}", DisplayErrorContext(&error))),
    }
}

fn classify_service_error(
    op: &str,
    key: &str,
    code: Option<&str>,
    status: u16,
    message: Option<&str>,
) -> StashError {
    let detail = message.unwrap_or("Unknown error");
    match code {
        Some("NoSuchKey") | Some("NotFound") => StashError::NotFound(key.to_string()),
        Some("NoSuchBucket") => StashError::storage("S3 bucket not found"),
        Some("AccessDenied")
        | Some("Forbidden")
        | Some("InvalidAccessKeyId")
        | Some("SignatureDoesNotMatch") => {
            StashError::storage("Access denied to S3 (check credentials and permissions)")
        }
        Some("SlowDown") | Some("Throttling") | Some("ThrottlingException") | Some("RequestTimeout")
        | Some("InternalError") | Some("ServiceUnavailable") => {
            StashError::network(format!(
                "S3 {op} transient service error ({}): {detail}",
                code.unwrap_or_default()
            ))
        }
        _ if status >= 500 || status == 429 => {
            StashError::network(format!("S3 {op} service error (HTTP {status}): {detail}"))
        }
        Some(code) => StashError::storage(format!("S3 service error ({code}): {detail}")),
        None if status == 404 => StashError::NotFound(key.to_string()),
        None => StashError::storage(format!("S3 {op} service error (HTTP {status}): {detail}")),
    }
}
