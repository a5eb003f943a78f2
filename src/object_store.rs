use crate::config::StorageConfig;
use crate::error::ImagingError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info, instrument};

/// Blob storage boundary: opaque bytes under keys.
///
/// Errors crossing this boundary are classified as `Transient` (worth a local
/// retry with backoff) or `Permanent` (surfaced immediately).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ImagingError>;

    /// `None` when no object exists under the key.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ImagingError>;

    async fn delete(&self, key: &str) -> Result<(), ImagingError>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ImagingError>;

    async fn exists(&self, key: &str) -> Result<bool, ImagingError>;
}

/// S3-backed object store.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build the S3 client from configuration.
    pub async fn new(config: &StorageConfig) -> Result<Self, ImagingError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ImagingError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| classify_sdk_error("failed to put object", e))?;

        debug!(key = %key, "Object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ImagingError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(classify_sdk_error("failed to get object", e));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ImagingError::Transient(format!("failed to read object body: {}", e)))?
            .into_bytes();

        Ok(Some(bytes))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), ImagingError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("failed to delete object", e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ImagingError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify_sdk_error("failed to list objects", e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, ImagingError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(classify_sdk_error("failed to check object existence", e))
                }
            }
        }
    }
}

/// Map an SDK error onto the transient/permanent boundary classification.
fn classify_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> ImagingError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            status >= 500 || status == 429
        }
        _ => false,
    };

    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    if retryable {
        ImagingError::Transient(message)
    } else {
        ImagingError::Permanent(message)
    }
}

/// Failure kind scripted into the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Permanent,
}

/// In-memory object store used by tests and local experimentation.
///
/// Put failures can be scripted per key to exercise retry and
/// compensating-cleanup paths.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    put_failures: Mutex<HashMap<String, VecDeque<InjectedFailure>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `times` puts of `key` to fail with `failure`.
    pub fn fail_put(&self, key: &str, failure: InjectedFailure, times: usize) {
        let mut failures = self.put_failures.lock().unwrap();
        failures
            .entry(key.to_string())
            .or_default()
            .extend(std::iter::repeat(failure).take(times));
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ImagingError> {
        if let Some(failure) = self
            .put_failures
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
        {
            return Err(match failure {
                InjectedFailure::Transient => {
                    ImagingError::Transient(format!("injected transient failure for {}", key))
                }
                InjectedFailure::Permanent => {
                    ImagingError::Permanent(format!("injected permanent failure for {}", key))
                }
            });
        }

        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ImagingError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), ImagingError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ImagingError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, ImagingError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}
