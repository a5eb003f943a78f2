use crate::config::TransferConfig;
use crate::dataset::{
    DatasetIdentifier, DatasetRecord, DatasetStatus, FrameRecord, UploadRequest, UploadType,
};
use crate::error::{ImagingError, UploadStage};
use crate::metadata_store::MetadataStore;
use crate::object_store::ObjectStore;
use crate::splitter::SplitterRegistry;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Folder names under a dataset's storage prefix.
const FILE_FOLDER_NAME: &str = "raw_files";
const FRAME_FOLDER_NAME: &str = "raw_frames";
const FRAME_FILE_FORMAT: &str = ".png";

/// Summary of a completed upload.
#[derive(Debug)]
pub struct UploadReport {
    pub dataset_id: DatasetIdentifier,
    pub upload_type: UploadType,
    pub blobs_written: usize,
    pub bytes_written: u64,
}

/// One planned blob write.
struct BlobWrite {
    key: String,
    bytes: Bytes,
}

/// Everything derived from the source during VALIDATING: the blobs to write
/// and the metadata rows to commit.
struct UploadPlan {
    writes: Vec<BlobWrite>,
    frames: Vec<FrameRecord>,
    global_metadata: Value,
}

/// Orchestrates one upload as a logically atomic unit.
///
/// State machine: VALIDATING → WRITING → COMMITTING → COMPLETE, with FAILED
/// reachable from the first three. Blobs are written before any metadata row
/// becomes visible; a failure after the first write triggers compensating
/// deletion of everything written under the dataset's storage prefix and the
/// dataset record is kept in FAILED state as an audit trail.
pub struct UploadCoordinator {
    store: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    splitters: SplitterRegistry,
    transfer: TransferConfig,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        transfer: TransferConfig,
    ) -> Self {
        Self::with_registry(store, metadata, SplitterRegistry::with_defaults(), transfer)
    }

    pub fn with_registry(
        store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        splitters: SplitterRegistry,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            splitters,
            transfer,
        }
    }

    /// Run one upload to completion or to a cleaned-up FAILED state.
    #[instrument(skip(self, request, cancel), fields(dataset_id = %request.dataset_id))]
    pub async fn upload(
        &self,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, ImagingError> {
        let id = DatasetIdentifier::parse(&request.dataset_id)?;

        info!(
            dataset_id = %id,
            upload_type = %request.upload_type,
            source = %request.source_path.display(),
            "Starting upload"
        );

        // Entry: the metadata store's uniqueness constraint is the duplicate
        // guard. No compensation runs on entry failure so an existing
        // dataset is never touched.
        self.enter(&id, request)
            .await
            .map_err(|e| upload_failed(&id, UploadStage::Validating, e))?;

        let written = Mutex::new(Vec::new());
        match self.run_stages(&id, request, cancel, &written).await {
            Ok(report) => {
                info!(
                    dataset_id = %id,
                    blobs = report.blobs_written,
                    bytes = report.bytes_written,
                    "Upload complete"
                );
                Ok(report)
            }
            Err((stage, cause)) => {
                warn!(dataset_id = %id, stage = %stage, error = %cause, "Upload failed, cleaning up");
                let written = written.into_inner().unwrap_or_default();
                self.compensate(&id, written).await;
                Err(upload_failed(&id, stage, cause))
            }
        }
    }

    /// Create the PENDING record, or reclaim a FAILED one after confirming
    /// its compensating cleanup.
    async fn enter(
        &self,
        id: &DatasetIdentifier,
        request: &UploadRequest,
    ) -> Result<(), ImagingError> {
        let record = DatasetRecord::pending(
            id.clone(),
            request.upload_type,
            request.description.clone(),
        );
        match self.metadata.create_pending(&record).await {
            Ok(()) => Ok(()),
            Err(ImagingError::DuplicateDataset(_)) => {
                match self.metadata.find_dataset(id).await? {
                    Some(existing) if existing.status == DatasetStatus::Failed => {
                        let leftovers = self.store.list(&id.storage_prefix()).await?;
                        for key in &leftovers {
                            self.delete_with_retry(key).await?;
                        }
                        if !leftovers.is_empty() {
                            warn!(
                                dataset_id = %id,
                                blobs = leftovers.len(),
                                "Removed leftover blobs from earlier failed upload"
                            );
                        }
                        self.metadata.reset_failed(id).await
                    }
                    _ => Err(ImagingError::DuplicateDataset(id.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_stages(
        &self,
        id: &DatasetIdentifier,
        request: &UploadRequest,
        cancel: &CancellationToken,
        written: &Mutex<Vec<String>>,
    ) -> Result<UploadReport, (UploadStage, ImagingError)> {
        // VALIDATING: read the source and, for FRAMES uploads, run the
        // splitter before any storage write happens.
        let source = tokio::fs::read(&request.source_path)
            .await
            .map_err(|e| (UploadStage::Validating, e.into()))?;
        let plan = self
            .plan_writes(id, request, &source)
            .map_err(|e| (UploadStage::Validating, e))?;

        // WRITING: independent blob writes, bounded concurrency, per-write
        // retry on transient errors.
        let bytes_written = self
            .write_blobs(&plan.writes, cancel, written)
            .await
            .map_err(|e| (UploadStage::Writing, e))?;

        // COMMITTING: one transaction makes all metadata visible at once.
        if cancel.is_cancelled() {
            return Err((UploadStage::Committing, ImagingError::Cancelled));
        }
        self.metadata
            .commit_dataset(id, &plan.global_metadata, &plan.frames)
            .await
            .map_err(|e| (UploadStage::Committing, e))?;

        Ok(UploadReport {
            dataset_id: id.clone(),
            upload_type: request.upload_type,
            blobs_written: plan.writes.len(),
            bytes_written,
        })
    }

    /// Derive blob keys, frame records and global metadata from the source.
    fn plan_writes(
        &self,
        id: &DatasetIdentifier,
        request: &UploadRequest,
        source: &[u8],
    ) -> Result<UploadPlan, ImagingError> {
        let prefix = id.storage_prefix();
        match request.upload_type {
            UploadType::File => {
                let file_name = source_file_name(&request.source_path)?;
                let key = format!("{}/{}/{}", prefix, FILE_FOLDER_NAME, file_name);
                let frames = vec![FrameRecord {
                    dataset_id: id.clone(),
                    frame_index: 0,
                    storage_key: key.clone(),
                    metadata: json!({ "file_name": file_name }),
                }];
                Ok(UploadPlan {
                    writes: vec![BlobWrite {
                        key,
                        bytes: Bytes::copy_from_slice(source),
                    }],
                    frames,
                    global_metadata: json!({
                        "file_origin": request.source_path.display().to_string(),
                    }),
                })
            }
            UploadType::Frames => {
                let format = declared_format(request);
                let split = self
                    .splitters
                    .split(source, &format, request.metadata_schema.as_ref())?;

                let global_metadata = global_metadata_for_frames(&request.source_path, &split);

                let mut writes = Vec::with_capacity(split.len());
                let mut frames = Vec::with_capacity(split.len());
                for frame in split {
                    let file_name = format!("{:06}{}", frame.index, FRAME_FILE_FORMAT);
                    let key = format!("{}/{}/{}", prefix, FRAME_FOLDER_NAME, file_name);
                    let mut metadata = frame.metadata;
                    if let Some(object) = metadata.as_object_mut() {
                        object.insert("file_name".to_string(), Value::String(file_name));
                    }
                    frames.push(FrameRecord {
                        dataset_id: id.clone(),
                        frame_index: frame.index,
                        storage_key: key.clone(),
                        metadata,
                    });
                    writes.push(BlobWrite {
                        key,
                        bytes: Bytes::from(frame.bytes),
                    });
                }
                Ok(UploadPlan {
                    writes,
                    frames,
                    global_metadata,
                })
            }
        }
    }

    /// Write all planned blobs, recording each confirmed key in `written` so
    /// a retry resumes instead of re-uploading and so the cleanup path knows
    /// its worklist.
    async fn write_blobs(
        &self,
        writes: &[BlobWrite],
        cancel: &CancellationToken,
        written: &Mutex<Vec<String>>,
    ) -> Result<u64, ImagingError> {
        let concurrency = self.transfer.upload_concurrency.max(1);
        let mut uploads = stream::iter(writes.iter().map(|write| async move {
            self.put_with_retry(&write.key, write.bytes.clone(), cancel)
                .await?;
            Ok::<_, ImagingError>((write.key.clone(), write.bytes.len() as u64))
        }))
        .buffer_unordered(concurrency);

        let mut bytes_written = 0u64;
        while let Some(result) = uploads.next().await {
            let (key, len) = result?;
            written.lock().unwrap().push(key);
            bytes_written += len;
        }
        Ok(bytes_written)
    }

    /// Put one blob, retrying transient store errors with bounded
    /// exponential backoff. Permanent errors and cancellation abort
    /// immediately.
    async fn put_with_retry(
        &self,
        key: &str,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), ImagingError> {
        let mut backoff = self.retry_policy();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ImagingError::Cancelled);
            }
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ImagingError::Cancelled),
                result = self.store.put(key, bytes.clone()) => result,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            key = %key,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient store error, retrying write"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ImagingError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    // Retry budget exhausted
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete_with_retry(&self, key: &str) -> Result<(), ImagingError> {
        let mut backoff = self.retry_policy();
        loop {
            match self.store.delete(key).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => match backoff.next_backoff() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.transfer.retry_initial_delay(),
            max_interval: self.transfer.retry_max_delay(),
            max_elapsed_time: Some(self.transfer.retry_max_elapsed()),
            ..Default::default()
        }
    }

    /// Compensating cleanup: delete every blob written under the dataset's
    /// prefix, then mark the record FAILED. The tracked worklist is merged
    /// with a prefix listing to catch writes that completed after the
    /// failure was observed.
    async fn compensate(&self, id: &DatasetIdentifier, written: Vec<String>) {
        let mut keys: BTreeSet<String> = written.into_iter().collect();
        match self.store.list(&id.storage_prefix()).await {
            Ok(listed) => keys.extend(listed),
            Err(e) => {
                error!(dataset_id = %id, error = %e, "Failed to list blobs during cleanup")
            }
        }

        for key in &keys {
            if let Err(e) = self.delete_with_retry(key).await {
                error!(dataset_id = %id, key = %key, error = %e, "Failed to delete blob during cleanup");
            }
        }

        if let Err(e) = self.metadata.mark_failed(id).await {
            error!(dataset_id = %id, error = %e, "Failed to mark dataset as failed");
        }
    }
}

fn upload_failed(id: &DatasetIdentifier, stage: UploadStage, source: ImagingError) -> ImagingError {
    ImagingError::UploadFailed {
        id: id.to_string(),
        stage,
        source: Box::new(source),
    }
}

fn source_file_name(path: &Path) -> Result<String, ImagingError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ImagingError::Permanent(format!("source path {} has no file name", path.display()))
        })
}

/// Splitter format: explicit from the request, otherwise derived from the
/// source file extension.
fn declared_format(request: &UploadRequest) -> String {
    if let Some(format) = &request.format {
        return format.clone();
    }
    match request
        .source_path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    {
        Some(ext) if ext == "png" => "png-stack".to_string(),
        Some(ext) => ext,
        None => String::new(),
    }
}

/// Global metadata in the shape the frame tables expect: source origin,
/// frame count and the image geometry shared by all frames.
fn global_metadata_for_frames(
    source_path: &Path,
    frames: &[crate::splitter::SplitFrame],
) -> Value {
    let mut global = Map::new();
    global.insert(
        "file_origin".to_string(),
        Value::String(source_path.display().to_string()),
    );
    global.insert("nbr_frames".to_string(), json!(frames.len()));
    if let Some(first) = frames.first() {
        for (global_key, frame_key) in [
            ("im_width", "width"),
            ("im_height", "height"),
            ("bit_depth", "bit_depth"),
            ("im_colors", "channels"),
        ] {
            if let Some(value) = first.metadata.get(frame_key) {
                global.insert(global_key.to_string(), value.clone());
            }
        }
    }
    Value::Object(global)
}
