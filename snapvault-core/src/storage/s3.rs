/*!
Amazon S3 snapshot store.

Snapshots live as objects directly under an optional key prefix. The object
basename is the snapshot name, so `backups/etcd/snapshot-1.db.zst` under the
prefix `backups/etcd/` is the snapshot `snapshot-1.db.zst`.
*/

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use chrono::{DateTime, Utc};
use snapvault_retry::{cloud_storage_backoff_policy, with_policy, BoxFuture, RetryError, RetryPolicy};
use tempfile::NamedTempFile;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use super::SnapshotStore;
use crate::config::S3Config;
use crate::record::{is_snapshot_file, Location, SnapshotRecord};
#[cfg(feature = "metrics")]
use crate::observability::MetricsTimer;
use crate::{Result, SnapvaultError};

/// Maximum keys per `DeleteObjects` request
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Attempts per S3 request before giving up
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Snapshot store backed by an S3 bucket
///
/// Every request runs on the store's own runtime and goes through the retry
/// policy, so callers stay synchronous.
///
/// # Authentication
/// Credentials come from the standard AWS provider chain: environment
/// variables, the shared credentials file, or an instance/task role.
///
/// # Example
/// ```rust,no_run
/// use snapvault_core::config::S3Config;
/// use snapvault_core::storage::{S3SnapshotStore, SnapshotStore};
///
/// let store = S3SnapshotStore::new(&S3Config::new("backups").with_prefix("etcd"))?;
/// for record in store.list()? {
///     println!("{} {}", record.name, record.size);
/// }
/// # Ok::<(), snapvault_core::SnapvaultError>(())
/// ```
#[derive(Debug, Clone)]
pub struct S3SnapshotStore {
    client: S3Client,
    bucket: String,
    prefix: String,
    retry: RetryPolicy,
    runtime: Arc<Runtime>,
}

impl S3SnapshotStore {
    /// Connect using the AWS provider chain and `config`
    pub fn new(config: &S3Config) -> Result<Self> {
        config.validate()?;
        let runtime = build_runtime()?;

        let sdk_config = runtime.block_on(async {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = &config.region {
                loader = loader.region(Region::new(region.clone()));
            }
            if let Some(endpoint) = &config.endpoint_url {
                loader = loader.endpoint_url(endpoint);
            }
            loader.load().await
        });

        if sdk_config.credentials_provider().is_none() {
            return Err(SnapvaultError::storage(
                "AWS credentials not found. Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY or configure a profile",
            ));
        }

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if config.endpoint_url.is_some() {
            s3_config = s3_config.force_path_style(true);
        }
        let client = S3Client::from_conf(s3_config.build());

        info!(
            bucket = %config.bucket,
            prefix = %config.normalized_prefix(),
            "Initialized S3 snapshot store"
        );
        Ok(Self::with_client(client, config, runtime))
    }

    /// Wrap an existing client
    pub fn with_client(client: S3Client, config: &S3Config, runtime: Runtime) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.normalized_prefix(),
            retry: RetryPolicy::new(cloud_storage_backoff_policy(), DEFAULT_MAX_ATTEMPTS),
            runtime: Arc::new(runtime),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Normalized key prefix, empty or ending in `/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Snapshot name for an object key, if the key is a snapshot directly
    /// under the prefix
    pub fn name_for_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let name = key.strip_prefix(self.prefix.as_str())?;
        if name.is_empty() || name.contains('/') || !is_snapshot_file(name) {
            return None;
        }
        Some(name)
    }

    fn run<T, F>(&self, operation: &'static str, key: &str, attempt: F) -> Result<T>
    where
        F: FnMut(usize) -> BoxFuture<'static, T>,
    {
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start(operation);
        #[cfg(feature = "metrics")]
        let mut attempt = attempt;
        #[cfg(feature = "metrics")]
        let attempt = |n: usize| {
            if n > 1 {
                timer.record_retry();
            }
            attempt(n)
        };

        let result = self
            .runtime
            .block_on(with_policy(operation, self.retry.clone(), attempt));

        #[cfg(feature = "metrics")]
        timer.finish(result.is_ok());

        result.map_err(|e| {
            let err = from_retry_error(e);
            error!(
                bucket = %self.bucket,
                key = %key,
                operation,
                error = %err,
                "S3 request failed"
            );
            err
        })
    }
}

impl SnapshotStore for S3SnapshotStore {
    fn location(&self) -> Location {
        Location::Remote
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn list(&self) -> Result<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let (client, bucket, prefix, token) = (
                self.client.clone(),
                self.bucket.clone(),
                self.prefix.clone(),
                continuation.clone(),
            );
            let page = self.run("list_objects_v2", &self.prefix, move |_| {
                let (client, bucket, prefix, token) =
                    (client.clone(), bucket.clone(), prefix.clone(), token.clone());
                Box::pin(async move {
                    let mut request = client.list_objects_v2().bucket(bucket);
                    if !prefix.is_empty() {
                        request = request.prefix(prefix.clone());
                    }
                    request
                        .set_continuation_token(token)
                        .send()
                        .await
                        .map_err(|e| classify("list_objects_v2", e, &prefix))
                })
            })?;
            pages += 1;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let Some(name) = self.name_for_key(key) else {
                    debug!(bucket = %self.bucket, key = %key, "Skipping non-snapshot object");
                    continue;
                };

                let mut record = SnapshotRecord::new(name, Location::Remote)
                    .with_store_key(key)
                    .with_size(object.size().map_or(0, |size| size.max(0) as u64));
                match object.last_modified().and_then(to_chrono) {
                    Some(at) => record = record.modified(at),
                    None => warn!(bucket = %self.bucket, key = %key, "Object has no modification time"),
                }
                records.push(record);
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(
            bucket = %self.bucket,
            prefix = %self.prefix,
            pages,
            count = records.len(),
            "Listed remote snapshots"
        );
        Ok(records)
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let key = self.key_for(name);
        let (client, bucket, object_key) = (self.client.clone(), self.bucket.clone(), key.clone());

        let exists = self.run("head_object", &key, move |_| {
            let (client, bucket, key) = (client.clone(), bucket.clone(), object_key.clone());
            Box::pin(async move {
                match client.head_object().bucket(bucket).key(key.clone()).send().await {
                    Ok(output) => Ok(output.content_length().unwrap_or(0) > 0),
                    Err(e) if is_not_found(&e) => Ok(false),
                    Err(e) => Err(classify("head_object", e, &key)),
                }
            })
        })?;

        debug!(bucket = %self.bucket, key = %key, exists, "Checked remote snapshot");
        Ok(exists)
    }

    fn put(&self, source: &Path, name: &str) -> Result<SnapshotRecord> {
        let key = self.key_for(name);
        let size = std::fs::metadata(source)
            .map_err(|e| SnapvaultError::storage(format!("Failed to stat {}: {}", source.display(), e)))?
            .len();

        info!(bucket = %self.bucket, key = %key, size, "Uploading snapshot to S3");
        let (client, bucket, object_key, path) = (
            self.client.clone(),
            self.bucket.clone(),
            key.clone(),
            source.to_path_buf(),
        );
        self.run("put_object", &key, move |_| {
            let (client, bucket, key, path) =
                (client.clone(), bucket.clone(), object_key.clone(), path.clone());
            Box::pin(async move {
                let body = ByteStream::from_path(&path).await.map_err(|e| RetryError::Permanent {
                    operation: "put_object",
                    source: Box::new(SnapvaultError::storage(format!(
                        "Failed to read {}: {}",
                        path.display(),
                        e
                    ))),
                })?;
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key.clone())
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| classify("put_object", e, &key))?;
                Ok(())
            })
        })?;

        Ok(SnapshotRecord::remote(name, Utc::now())
            .with_store_key(key)
            .with_size(size))
    }

    fn fetch(&self, name: &str, dest: &Path) -> Result<u64> {
        let key = self.key_for(name);
        let parent = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        info!(bucket = %self.bucket, key = %key, dest = %dest.display(), "Downloading snapshot from S3");
        let (client, bucket, object_key, dest_path) = (
            self.client.clone(),
            self.bucket.clone(),
            key.clone(),
            dest.to_path_buf(),
        );
        let written = self.run("get_object", &key, move |_| {
            let (client, bucket, key, parent, dest) = (
                client.clone(),
                bucket.clone(),
                object_key.clone(),
                parent.clone(),
                dest_path.clone(),
            );
            Box::pin(async move {
                let output = client
                    .get_object()
                    .bucket(bucket)
                    .key(key.clone())
                    .send()
                    .await
                    .map_err(|e| classify("get_object", e, &key))?;

                // Dropping the staged file on any failure removes the partial download.
                let mut staged = NamedTempFile::new_in(&parent).map_err(|e| local_io("get_object", e))?;
                let mut body = output.body;
                let mut written = 0u64;
                while let Some(chunk) = body.try_next().await.map_err(|e| RetryError::Transient {
                    operation: "get_object",
                    source: Box::new(SnapvaultError::storage(format!(
                        "Failed to read S3 object stream for '{key}': {e}"
                    ))),
                })? {
                    staged.write_all(&chunk).map_err(|e| local_io("get_object", e))?;
                    written += chunk.len() as u64;
                }
                staged.flush().map_err(|e| local_io("get_object", e))?;
                staged
                    .persist(&dest)
                    .map_err(|e| local_io("get_object", e.error))?;
                Ok(written)
            })
        })?;

        debug!(bucket = %self.bucket, key = %key, bytes = written, "Downloaded snapshot");
        Ok(written)
    }

    fn delete(&self, key: &str) -> Result<()> {
        info!(bucket = %self.bucket, key = %key, "Deleting snapshot from S3");
        let (client, bucket, object_key) = (self.client.clone(), self.bucket.clone(), key.to_string());
        self.run("delete_object", key, move |_| {
            let (client, bucket, key) = (client.clone(), bucket.clone(), object_key.clone());
            Box::pin(async move {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(key.clone())
                    .send()
                    .await
                    .map_err(|e| classify("delete_object", e, &key))?;
                Ok(())
            })
        })
    }

    fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;

        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SnapvaultError::storage(format!("Invalid delete request: {e}")))?;
            let request = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| SnapvaultError::storage(format!("Invalid delete request: {e}")))?;

            info!(bucket = %self.bucket, count = batch.len(), "Deleting snapshot batch from S3");
            let (client, bucket) = (self.client.clone(), self.bucket.clone());
            let output = self.run("delete_objects", &self.prefix, move |_| {
                let (client, bucket, request) = (client.clone(), bucket.clone(), request.clone());
                Box::pin(async move {
                    client
                        .delete_objects()
                        .bucket(bucket)
                        .delete(request)
                        .send()
                        .await
                        .map_err(|e| classify("delete_objects", e, ""))
                })
            })?;

            let failures: Vec<String> = output
                .errors()
                .iter()
                .map(|failure| {
                    format!(
                        "{} ({})",
                        failure.key().unwrap_or("?"),
                        failure.message().or(failure.code()).unwrap_or("unknown error")
                    )
                })
                .collect();
            if !failures.is_empty() {
                error!(bucket = %self.bucket, failed = failures.len(), "S3 batch delete partially failed");
                return Err(SnapvaultError::storage(format!(
                    "Failed to delete {} of {} objects: {}",
                    failures.len(),
                    batch.len(),
                    failures.join(", ")
                )));
            }
            deleted += batch.len();
        }

        Ok(deleted)
    }
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .build()
        .map_err(|e| SnapvaultError::storage(format!("Failed to create async runtime for S3 client: {e}")))
}

fn to_chrono(at: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(at.secs(), at.subsec_nanos())
}

fn local_io(operation: &'static str, error: std::io::Error) -> RetryError {
    RetryError::Permanent {
        operation,
        source: Box::new(SnapvaultError::Io(error)),
    }
}

fn is_not_found<E: ProvideErrorMetadata>(error: &SdkError<E, HttpResponse>) -> bool {
    let status_404 = error
        .raw_response()
        .map_or(false, |response| response.status().as_u16() == 404);
    status_404 || matches!(error.code(), Some("NotFound" | "NoSuchKey"))
}

/// True for failures worth another attempt: transport problems, throttling
/// and server-side errors
fn is_transient<E: ProvideErrorMetadata>(error: &SdkError<E, HttpResponse>) -> bool {
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(service) => {
            matches!(
                service.err().code(),
                Some("InternalError" | "ServiceUnavailable" | "SlowDown" | "RequestTimeout" | "Throttling")
            ) || service.raw().status().as_u16() >= 500
        }
        _ => false,
    }
}

fn classify<E>(operation: &'static str, error: SdkError<E, HttpResponse>, key: &str) -> RetryError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let transient = is_transient(&error);
    let source = Box::new(map_s3_error(operation, &error, key));
    if transient {
        RetryError::Transient { operation, source }
    } else {
        RetryError::Permanent { operation, source }
    }
}

/// Map AWS SDK errors to storage errors with bucket-agnostic context
fn map_s3_error<E>(operation: &str, error: &SdkError<E, HttpResponse>, key: &str) -> SnapvaultError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match error {
        SdkError::TimeoutError(_) => {
            SnapvaultError::storage(format!("S3 {operation} request timed out (key: {key})"))
        }
        SdkError::DispatchFailure(_) => SnapvaultError::storage(format!(
            "S3 {operation} request failed to dispatch: {}",
            DisplayErrorContext(error)
        )),
        SdkError::ServiceError(service) => match service.err().code() {
            Some("NoSuchBucket") => SnapvaultError::storage("S3 bucket not found"),
            Some("NoSuchKey") => SnapvaultError::storage(format!("S3 object '{key}' not found")),
            Some("AccessDenied" | "Forbidden") => SnapvaultError::storage(
                "Access denied to S3 (check credentials and permissions)",
            ),
            Some(code) => SnapvaultError::storage(format!(
                "S3 {operation} service error ({code}): {}",
                service.err().message().unwrap_or("unknown error")
            )),
            None => SnapvaultError::storage(format!(
                "S3 {operation} service error: {}",
                DisplayErrorContext(error)
            )),
        },
        _ => SnapvaultError::storage(format!("S3 {operation} error: {}", DisplayErrorContext(error))),
    }
}

/// Unwrap the storage error carried by a retry outcome
fn from_retry_error(error: RetryError) -> SnapvaultError {
    if matches!(error, RetryError::MaxRetriesExceeded { .. }) {
        return SnapvaultError::storage(error.to_string());
    }
    match error.into_source().downcast::<SnapvaultError>() {
        Ok(inner) => *inner,
        Err(other) => SnapvaultError::storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::head_object::HeadObjectError;

    fn offline_store(prefix: &str) -> S3SnapshotStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        S3SnapshotStore::with_client(
            S3Client::from_conf(config),
            &S3Config::new("backups").with_prefix(prefix),
            runtime,
        )
    }

    #[test]
    fn test_keys_and_names_follow_prefix() {
        let store = offline_store("/etcd/prod");
        assert_eq!(store.prefix(), "etcd/prod/");
        assert_eq!(store.key_for("a.db.zst"), "etcd/prod/a.db.zst");
        assert_eq!(store.describe(), "s3://backups/etcd/prod/");
        assert_eq!(store.location(), Location::Remote);

        assert_eq!(store.name_for_key("etcd/prod/a.db.zst"), Some("a.db.zst"));
        assert_eq!(store.name_for_key("etcd/prod/"), None);
        assert_eq!(store.name_for_key("etcd/prod/nested/a.db"), None);
        assert_eq!(store.name_for_key("etcd/prod/notes.txt"), None);
        assert_eq!(store.name_for_key("other/a.db"), None);
    }

    #[test]
    fn test_unprefixed_store() {
        let store = offline_store("");
        assert_eq!(store.key_for("a.db"), "a.db");
        assert_eq!(store.name_for_key("a.db"), Some("a.db"));
        assert_eq!(store.name_for_key("dir/a.db"), None);
    }

    #[test]
    fn test_timestamp_conversion() {
        let at = AwsDateTime::from_secs_and_nanos(1_700_000_000, 500);
        let converted = to_chrono(&at).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 500);
    }

    #[test]
    fn test_timeouts_are_transient() {
        let error = SdkError::<HeadObjectError, HttpResponse>::timeout_error(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow",
        ));
        assert!(is_transient(&error));

        let classified = classify("head_object", error, "etcd/a.db");
        assert!(matches!(classified, RetryError::Transient { .. }));

        let mapped = from_retry_error(classified);
        match mapped {
            SnapvaultError::Storage(msg) => {
                assert!(msg.contains("timed out"));
                assert!(msg.contains("etcd/a.db"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_construction_failures_are_permanent() {
        let error = SdkError::<HeadObjectError, HttpResponse>::construction_failure(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bad request",
        ));
        assert!(!is_transient(&error));
        assert!(matches!(
            classify("head_object", error, "a.db"),
            RetryError::Permanent { .. }
        ));
    }

    #[test]
    fn test_exhausted_retries_keep_attempt_context() {
        let error = RetryError::MaxRetriesExceeded {
            operation: "list_objects_v2",
            attempts: 5,
            source: Box::new(SnapvaultError::storage("S3 list_objects_v2 request timed out")),
        };
        let mapped = from_retry_error(error);
        assert!(mapped.to_string().contains("list_objects_v2"));
        assert!(mapped.to_string().contains('5'));
    }

    #[test]
    fn test_local_io_failures_are_permanent() {
        let error = local_io("get_object", std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(matches!(from_retry_error(error), SnapvaultError::Io(_)));
    }
}
