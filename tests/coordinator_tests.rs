//! End-to-end coordinator tests over the in-memory backends.

use imaging_db::config::TransferConfig;
use imaging_db::dataset::{DatasetIdentifier, DatasetRecord, DatasetStatus, UploadRequest, UploadType};
use imaging_db::downloader::{DownloadCoordinator, DownloadOptions};
use imaging_db::error::{ImagingError, UploadStage};
use imaging_db::metadata_store::{MemoryMetadataStore, MetadataStore};
use imaging_db::object_store::{InjectedFailure, MemoryObjectStore, ObjectStore};
use imaging_db::uploader::UploadCoordinator;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DATASET_ID: &str = "ISP-2018-04-05-00-00-00-0001";
const PREFIX: &str = "datasets/ISP-2018-04-05-00-00-00-0001";

struct Harness {
    store: Arc<MemoryObjectStore>,
    metadata: Arc<MemoryMetadataStore>,
    uploader: UploadCoordinator,
    downloader: DownloadCoordinator,
    tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryObjectStore::new());
    let metadata = Arc::new(MemoryMetadataStore::new());
    // Tight retry budget so transient-failure tests finish quickly.
    let transfer = TransferConfig {
        upload_concurrency: 4,
        download_concurrency: 4,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        retry_max_elapsed_ms: 1_000,
    };
    let uploader = UploadCoordinator::new(
        store.clone() as Arc<dyn ObjectStore>,
        metadata.clone() as Arc<dyn MetadataStore>,
        transfer.clone(),
    );
    let downloader = DownloadCoordinator::new(
        store.clone() as Arc<dyn ObjectStore>,
        metadata.clone() as Arc<dyn MetadataStore>,
        transfer,
    );
    Harness {
        store,
        metadata,
        uploader,
        downloader,
        tmp: tempfile::tempdir().unwrap(),
    }
}

fn png_chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);
    out.extend_from_slice(&[0u8; 4]);
    out
}

fn png(width: u32, height: u32, payload: u8) -> Vec<u8> {
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);

    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    out.extend_from_slice(&png_chunk(b"IHDR", &ihdr));
    out.extend_from_slice(&png_chunk(b"IDAT", &[payload; 16]));
    out.extend_from_slice(&png_chunk(b"IEND", &[]));
    out
}

fn png_stack(frames: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..frames {
        out.extend_from_slice(&png(64, 32, i as u8));
    }
    out
}

async fn write_source(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, bytes).await.unwrap();
    path
}

fn frames_request(source: PathBuf) -> UploadRequest {
    UploadRequest {
        dataset_id: DATASET_ID.to_string(),
        source_path: source,
        upload_type: UploadType::Frames,
        format: None,
        metadata_schema: None,
        description: Some("test acquisition".to_string()),
    }
}

fn unwrap_upload_failure(err: ImagingError) -> (UploadStage, ImagingError) {
    match err {
        ImagingError::UploadFailed { stage, source, .. } => (stage, *source),
        other => panic!("expected UploadFailed, got {:?}", other),
    }
}

fn dataset_id() -> DatasetIdentifier {
    DatasetIdentifier::parse(DATASET_ID).unwrap()
}

#[tokio::test]
async fn test_file_upload_round_trip() {
    let h = harness();
    let source = write_source(h.tmp.path(), "scan.ome.tif", b"raw microscope bytes").await;
    let request = UploadRequest {
        dataset_id: DATASET_ID.to_string(),
        source_path: source,
        upload_type: UploadType::File,
        format: None,
        metadata_schema: None,
        description: None,
    };

    let report = h
        .uploader
        .upload(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.blobs_written, 1);

    let record = h.metadata.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(record.status, DatasetStatus::Complete);
    let key = format!("{}/raw_files/scan.ome.tif", PREFIX);
    assert!(h.store.exists(&key).await.unwrap());
    assert_eq!(h.metadata.list_frames(&dataset_id()).await.unwrap().len(), 1);

    // Download the single file back.
    let dest = h.tmp.path().join("out");
    let report = h
        .downloader
        .download(&dataset_id(), &dest, &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(report.files_written, 1);
    let downloaded = tokio::fs::read(dest.join(DATASET_ID).join("scan.ome.tif"))
        .await
        .unwrap();
    assert_eq!(downloaded, b"raw microscope bytes");
    // FILE datasets get the global metadata document but no frame table.
    assert!(dest.join(DATASET_ID).join("global_metadata.json").exists());
    assert!(!dest.join(DATASET_ID).join("frames_meta.csv").exists());
}

#[tokio::test]
async fn test_frames_upload_writes_all_frames_and_commits() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(5)).await;

    let report = h
        .uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.blobs_written, 5);

    let keys = h.store.list(PREFIX).await.unwrap();
    assert_eq!(keys.len(), 5);
    assert_eq!(keys[0], format!("{}/raw_frames/000000.png", PREFIX));
    assert_eq!(keys[4], format!("{}/raw_frames/000004.png", PREFIX));

    let record = h.metadata.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(record.status, DatasetStatus::Complete);
    assert_eq!(record.global_metadata["nbr_frames"], 5);
    assert_eq!(record.global_metadata["im_width"], 64);

    let frames = h.metadata.list_frames(&dataset_id()).await.unwrap();
    assert_eq!(frames.len(), 5);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.frame_index, i as u32);
        assert_eq!(frame.metadata["width"], 64);
    }
}

#[tokio::test]
async fn test_duplicate_upload_rejected_without_touching_first() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(3)).await;
    let request = frames_request(source);
    let cancel = CancellationToken::new();

    h.uploader.upload(&request, &cancel).await.unwrap();
    let blobs_before = h.store.object_count();

    let err = h.uploader.upload(&request, &cancel).await.unwrap_err();
    let (stage, source) = unwrap_upload_failure(err);
    assert_eq!(stage, UploadStage::Validating);
    assert!(matches!(source, ImagingError::DuplicateDataset(_)));

    // First attempt's data is unaffected.
    assert_eq!(h.store.object_count(), blobs_before);
    let record = h.metadata.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(record.status, DatasetStatus::Complete);
    assert_eq!(h.metadata.list_frames(&dataset_id()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_write_failure_leaves_no_blobs_and_failed_record() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(5)).await;
    // Third of five frame writes fails permanently.
    h.store.fail_put(
        &format!("{}/raw_frames/000002.png", PREFIX),
        InjectedFailure::Permanent,
        1,
    );

    let err = h
        .uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap_err();
    let (stage, source) = unwrap_upload_failure(err);
    assert_eq!(stage, UploadStage::Writing);
    assert!(matches!(source, ImagingError::Permanent(_)));

    // Zero blobs remain, no frame rows, and a FAILED audit record.
    assert!(h.store.list(PREFIX).await.unwrap().is_empty());
    assert!(h.metadata.list_frames(&dataset_id()).await.unwrap().is_empty());
    let record = h.metadata.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(record.status, DatasetStatus::Failed);
}

#[tokio::test]
async fn test_transient_write_errors_are_retried() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(4)).await;
    h.store.fail_put(
        &format!("{}/raw_frames/000001.png", PREFIX),
        InjectedFailure::Transient,
        2,
    );

    let report = h
        .uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.blobs_written, 4);
    assert_eq!(h.store.list(PREFIX).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_failed_upload_can_be_retried_fresh() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(3)).await;
    h.store.fail_put(
        &format!("{}/raw_frames/000001.png", PREFIX),
        InjectedFailure::Permanent,
        1,
    );

    let cancel = CancellationToken::new();
    let request = frames_request(source);
    h.uploader.upload(&request, &cancel).await.unwrap_err();
    assert_eq!(
        h.metadata
            .find_dataset(&dataset_id())
            .await
            .unwrap()
            .unwrap()
            .status,
        DatasetStatus::Failed
    );

    // The injected failure is consumed; a fresh attempt over the FAILED
    // record succeeds.
    h.uploader.upload(&request, &cancel).await.unwrap();
    let record = h.metadata.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(record.status, DatasetStatus::Complete);
    assert_eq!(h.store.list(PREFIX).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_validation_failure_happens_before_any_write() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(2)).await;
    let mut request = frames_request(source);
    request.metadata_schema = Some(json!({"required": ["exposure_ms"]}));

    let err = h
        .uploader
        .upload(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    let (stage, source) = unwrap_upload_failure(err);
    assert_eq!(stage, UploadStage::Validating);
    assert!(matches!(
        source,
        ImagingError::MetadataValidation { frame_index: 0, .. }
    ));
    assert_eq!(h.store.object_count(), 0);
}

#[tokio::test]
async fn test_corrupt_source_fails_validation() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", b"definitely not a png").await;

    let err = h
        .uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap_err();
    let (stage, source) = unwrap_upload_failure(err);
    assert_eq!(stage, UploadStage::Validating);
    assert!(matches!(source, ImagingError::CorruptInput(_)));
    assert_eq!(h.store.object_count(), 0);
}

#[tokio::test]
async fn test_cancelled_upload_takes_cleanup_path() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(3)).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .uploader
        .upload(&frames_request(source), &cancel)
        .await
        .unwrap_err();
    let (stage, source) = unwrap_upload_failure(err);
    assert_eq!(stage, UploadStage::Writing);
    assert!(matches!(source, ImagingError::Cancelled));

    assert!(h.store.list(PREFIX).await.unwrap().is_empty());
    let record = h.metadata.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(record.status, DatasetStatus::Failed);
}

#[tokio::test]
async fn test_download_produces_frames_and_sidecars() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(4)).await;
    let cancel = CancellationToken::new();
    h.uploader
        .upload(&frames_request(source), &cancel)
        .await
        .unwrap();

    let dest = h.tmp.path().join("out");
    let report = h
        .downloader
        .download(&dataset_id(), &dest, &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(report.files_written, 4);

    let dataset_dir = dest.join(DATASET_ID);
    for i in 0..4 {
        let frame_path = dataset_dir.join(format!("{:06}.png", i));
        let bytes = tokio::fs::read(&frame_path).await.unwrap();
        assert_eq!(bytes, png(64, 32, i as u8));
    }

    let global: serde_json::Value = serde_json::from_slice(
        &tokio::fs::read(dataset_dir.join("global_metadata.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(global["dataset_id"], DATASET_ID);
    assert_eq!(global["nbr_frames"], 4);

    let table = tokio::fs::read_to_string(dataset_dir.join("frames_meta.csv"))
        .await
        .unwrap();
    // Header plus one row per frame.
    assert_eq!(table.lines().count(), 5);
    assert!(table.lines().next().unwrap().starts_with("frame_index,file_name"));
}

#[tokio::test]
async fn test_download_is_idempotent_after_partial_local_state() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(3)).await;
    h.uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap();

    let dest = h.tmp.path().join("out");
    let options = DownloadOptions::default();
    h.downloader
        .download(&dataset_id(), &dest, &options)
        .await
        .unwrap();

    let dataset_dir = dest.join(DATASET_ID);
    // Simulate an interrupted earlier run: one frame missing, one truncated.
    tokio::fs::remove_file(dataset_dir.join("000001.png"))
        .await
        .unwrap();
    tokio::fs::write(dataset_dir.join("000002.png"), b"partial")
        .await
        .unwrap();

    h.downloader
        .download(&dataset_id(), &dest, &options)
        .await
        .unwrap();

    for i in 0..3 {
        let bytes = tokio::fs::read(dataset_dir.join(format!("{:06}.png", i)))
            .await
            .unwrap();
        assert_eq!(bytes, png(64, 32, i as u8));
    }
}

#[tokio::test]
async fn test_download_refuses_pending_failed_and_unknown_datasets() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(2)).await;
    let dest = h.tmp.path().join("out");
    let options = DownloadOptions::default();

    // Unknown dataset.
    let err = h
        .downloader
        .download(&dataset_id(), &dest, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::DatasetNotFound(_)));

    // Pending dataset (another process mid-upload).
    let pending = harness();
    pending
        .metadata
        .create_pending(&DatasetRecord::pending(
            dataset_id(),
            UploadType::Frames,
            None,
        ))
        .await
        .unwrap();
    let err = pending
        .downloader
        .download(&dataset_id(), &dest, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::DatasetNotFound(_)));

    // Failed dataset.
    h.store.fail_put(
        &format!("{}/raw_frames/000000.png", PREFIX),
        InjectedFailure::Permanent,
        1,
    );
    h.uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap_err();
    let err = h
        .downloader
        .download(&dataset_id(), &dest, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::DatasetNotFound(_)));
}

#[tokio::test]
async fn test_download_detects_remote_drift() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(3)).await;
    h.uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap();

    // A blob vanishes behind the metadata's back.
    h.store
        .delete(&format!("{}/raw_frames/000001.png", PREFIX))
        .await
        .unwrap();

    let dest = h.tmp.path().join("out");
    let err = h
        .downloader
        .download(&dataset_id(), &dest, &DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::IncompleteRemoteState { .. }));

    // An orphan blob is drift too.
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(3)).await;
    h.uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap();
    h.store
        .put(
            &format!("{}/raw_frames/000099.png", PREFIX),
            bytes::Bytes::from_static(b"orphan"),
        )
        .await
        .unwrap();
    let err = h
        .downloader
        .download(&dataset_id(), &dest, &DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::IncompleteRemoteState { .. }));
}

#[tokio::test]
async fn test_metadata_only_download() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(2)).await;
    h.uploader
        .upload(&frames_request(source), &CancellationToken::new())
        .await
        .unwrap();

    let dest = h.tmp.path().join("out");
    let options = DownloadOptions {
        metadata: true,
        download: false,
    };
    let report = h
        .downloader
        .download(&dataset_id(), &dest, &options)
        .await
        .unwrap();
    assert_eq!(report.files_written, 0);

    let dataset_dir = dest.join(DATASET_ID);
    assert!(dataset_dir.join("global_metadata.json").exists());
    assert!(dataset_dir.join("frames_meta.csv").exists());
    assert!(!dataset_dir.join("000000.png").exists());
}

#[tokio::test]
async fn test_download_with_everything_disabled_is_an_error() {
    let h = harness();
    let options = DownloadOptions {
        metadata: false,
        download: false,
    };
    let err = h
        .downloader
        .download(&dataset_id(), h.tmp.path(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::Permanent(_)));
}

#[tokio::test]
async fn test_malformed_identifier_rejected_before_any_effect() {
    let h = harness();
    let source = write_source(h.tmp.path(), "stack.png", &png_stack(1)).await;
    let mut request = frames_request(source);
    request.dataset_id = "not-a-valid-id".to_string();

    let err = h
        .uploader
        .upload(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ImagingError::MalformedIdentifier { .. }));
    assert_eq!(h.store.object_count(), 0);
}
