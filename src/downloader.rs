use crate::config::TransferConfig;
use crate::dataset::{DatasetIdentifier, DatasetRecord, DatasetStatus, FrameRecord, UploadType};
use crate::error::ImagingError;
use crate::metadata_store::MetadataStore;
use crate::object_store::ObjectStore;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

/// Sidecar file names written next to the downloaded blobs.
const GLOBAL_METADATA_FILE: &str = "global_metadata.json";
const FRAMES_META_FILE: &str = "frames_meta.csv";

/// What to materialize at the destination.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Write metadata sidecar files
    pub metadata: bool,
    /// Download all blobs
    pub download: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            metadata: true,
            download: true,
        }
    }
}

/// Summary of a completed download.
#[derive(Debug)]
pub struct DownloadReport {
    pub dataset_id: DatasetIdentifier,
    pub destination: PathBuf,
    pub files_written: usize,
    pub metadata_written: bool,
}

/// Materializes a COMPLETE dataset to a local destination, idempotently:
/// re-running overwrites destination files, so an interrupted download
/// converges to the same result as an uninterrupted one.
pub struct DownloadCoordinator {
    store: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    transfer: TransferConfig,
}

impl DownloadCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            transfer,
        }
    }

    #[instrument(skip(self, destination, options), fields(dataset_id = %id))]
    pub async fn download(
        &self,
        id: &DatasetIdentifier,
        destination: &Path,
        options: &DownloadOptions,
    ) -> Result<DownloadReport, ImagingError> {
        if !options.metadata && !options.download {
            return Err(ImagingError::Permanent(
                "metadata and download both disabled, nothing to do".to_string(),
            ));
        }

        // PENDING and FAILED datasets are not downloadable.
        let record = match self.metadata.find_dataset(id).await? {
            Some(record) if record.status == DatasetStatus::Complete => record,
            _ => return Err(ImagingError::DatasetNotFound(id.to_string())),
        };
        let frames = self.metadata.list_frames(id).await?;

        let dest_dir = destination.join(id.to_string());
        tokio::fs::create_dir_all(&dest_dir).await?;

        let mut files_written = 0;
        if options.download {
            self.verify_remote_state(&record, &frames).await?;
            files_written = self.fetch_blobs(&frames, &dest_dir).await?;
        }

        if options.metadata {
            write_global_metadata(&record, &dest_dir).await?;
            if record.upload_type == UploadType::Frames {
                let table = frames_table(&frames);
                tokio::fs::write(dest_dir.join(FRAMES_META_FILE), table).await?;
            }
        }

        info!(
            dataset_id = %id,
            destination = %dest_dir.display(),
            files = files_written,
            metadata = options.metadata,
            "Download complete"
        );

        Ok(DownloadReport {
            dataset_id: id.clone(),
            destination: dest_dir,
            files_written,
            metadata_written: options.metadata,
        })
    }

    /// Defensive drift check: the blob set under the prefix must exactly
    /// match the recorded frame set, in both directions, before any blob is
    /// fetched.
    async fn verify_remote_state(
        &self,
        record: &DatasetRecord,
        frames: &[FrameRecord],
    ) -> Result<(), ImagingError> {
        let expected: BTreeSet<&str> = frames.iter().map(|f| f.storage_key.as_str()).collect();
        let listed = self.store.list(&record.storage_prefix).await?;
        let remote: BTreeSet<&str> = listed.iter().map(String::as_str).collect();

        let missing: Vec<&&str> = expected.difference(&remote).collect();
        let unexpected: Vec<&&str> = remote.difference(&expected).collect();
        if missing.is_empty() && unexpected.is_empty() {
            return Ok(());
        }

        let mut detail = Vec::new();
        if !missing.is_empty() {
            detail.push(format!(
                "{} recorded blob(s) missing from storage (first: {})",
                missing.len(),
                missing[0]
            ));
        }
        if !unexpected.is_empty() {
            detail.push(format!(
                "{} blob(s) in storage without a metadata row (first: {})",
                unexpected.len(),
                unexpected[0]
            ));
        }
        Err(ImagingError::IncompleteRemoteState {
            id: record.id.to_string(),
            detail: detail.join("; "),
        })
    }

    async fn fetch_blobs(
        &self,
        frames: &[FrameRecord],
        dest_dir: &Path,
    ) -> Result<usize, ImagingError> {
        let concurrency = self.transfer.download_concurrency.max(1);
        let mut downloads = stream::iter(frames.iter().map(|frame| async move {
            let bytes = self.store.get(&frame.storage_key).await?.ok_or_else(|| {
                ImagingError::IncompleteRemoteState {
                    id: frame.dataset_id.to_string(),
                    detail: format!("blob {} disappeared during download", frame.storage_key),
                }
            })?;
            let path = dest_dir.join(key_basename(&frame.storage_key));
            tokio::fs::write(&path, &bytes).await?;
            Ok::<_, ImagingError>(())
        }))
        .buffer_unordered(concurrency);

        let mut files_written = 0;
        while let Some(result) = downloads.next().await {
            result?;
            files_written += 1;
        }
        Ok(files_written)
    }
}

async fn write_global_metadata(
    record: &DatasetRecord,
    dest_dir: &Path,
) -> Result<(), ImagingError> {
    let mut doc = match record.global_metadata.clone() {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("metadata".to_string(), other);
            map
        }
    };
    doc.insert("dataset_id".to_string(), json!(record.id.to_string()));
    doc.insert("upload_type".to_string(), json!(record.upload_type.as_str()));
    doc.insert(
        "storage_prefix".to_string(),
        json!(record.storage_prefix.clone()),
    );
    if let Some(description) = &record.description {
        doc.insert("description".to_string(), json!(description));
    }

    let rendered = serde_json::to_vec_pretty(&Value::Object(doc))
        .map_err(|e| ImagingError::Permanent(format!("failed to render global metadata: {}", e)))?;
    tokio::fs::write(dest_dir.join(GLOBAL_METADATA_FILE), rendered).await?;
    Ok(())
}

fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Render one row per frame: index, file name, then the union of metadata
/// keys across all frames in sorted order.
fn frames_table(frames: &[FrameRecord]) -> String {
    let mut keys: BTreeSet<String> = BTreeSet::new();
    for frame in frames {
        if let Some(object) = frame.metadata.as_object() {
            keys.extend(object.keys().filter(|k| *k != "file_name").cloned());
        }
    }

    let mut header: Vec<String> = vec!["frame_index".to_string(), "file_name".to_string()];
    header.extend(keys.iter().cloned());

    let mut out = String::new();
    out.push_str(&join_row(header.iter().map(String::as_str)));
    out.push('\n');

    for frame in frames {
        let index = frame.frame_index.to_string();
        let file_name = key_basename(&frame.storage_key).to_string();
        let mut cells = vec![index, file_name];
        for key in &keys {
            cells.push(csv_cell(frame.metadata.get(key)));
        }
        out.push_str(&join_row(cells.iter().map(String::as_str)));
        out.push('\n');
    }
    out
}

fn join_row<'a>(cells: impl Iterator<Item = &'a str>) -> String {
    cells.map(escape_csv).collect::<Vec<_>>().join(",")
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn escape_csv(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
