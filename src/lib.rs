//! Imaging dataset store
//!
//! Synchronization engine keeping object-storage content and relational
//! metadata records consistent under partial failure. Scientific image files
//! are uploaded to S3 either whole or split into frames, with dataset and
//! per-frame metadata recorded in PostgreSQL; a companion downloader
//! materializes a dataset back to a local folder.
//!
//! ## Guarantees
//!
//! - **No partial metadata, ever**: all metadata rows for a dataset become
//!   visible in one transaction, after every blob is durably written.
//! - **Failed uploads leave no blobs behind**: any failure after the first
//!   write triggers compensating deletion under the dataset's storage prefix;
//!   the dataset record is kept in FAILED state as an audit trail.
//! - **Duplicate uploads are rejected by constraint**: the dataset identifier
//!   is unique in the metadata store, so two processes racing to create the
//!   same dataset cannot both win.
//!
//! ## Architecture
//!
//! ```text
//! csv manifest                S3 Bucket                  PostgreSQL
//! ┌──────────────┐           ┌────────────────┐          ┌──────────────┐
//! │ data-uploader│           │ datasets/{id}/ │          │ datasets     │
//! │     CLI      │──────────▶│   raw_files/   │          │ frames       │
//! └──────────────┘           │   raw_frames/  │          └──────────────┘
//!        │                   └────────────────┘                 ▲
//!        ▼                          ▲                           │
//! ┌──────────────┐                  │                           │
//! │ Frame        │           ┌──────────────┐           ┌──────────────┐
//! │ Splitter     │──────────▶│ Upload       │──────────▶│ Metadata     │
//! └──────────────┘           │ Coordinator  │           │ Store        │
//!                            └──────────────┘           └──────────────┘
//!                                   ▲
//!                            ┌──────────────┐
//!                            │ Download     │
//!                            │ Coordinator  │
//!                            └──────────────┘
//! ```

pub mod config;
pub mod dataset;
pub mod downloader;
pub mod error;
pub mod manifest;
pub mod metadata_store;
pub mod object_store;
pub mod splitter;
pub mod uploader;

pub use config::{Config, DatabaseConfig, DbCredentials, StorageConfig, TransferConfig};
pub use dataset::{
    DatasetIdentifier, DatasetRecord, DatasetStatus, FrameRecord, UploadRequest, UploadType,
};
pub use downloader::{DownloadCoordinator, DownloadOptions, DownloadReport};
pub use error::{ImagingError, UploadStage};
pub use metadata_store::{MemoryMetadataStore, MetadataStore, PgMetadataStore};
pub use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use splitter::{FrameDecoder, MetadataValidator, SplitFrame, SplitterRegistry};
pub use uploader::{UploadCoordinator, UploadReport};
