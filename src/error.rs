use thiserror::Error;

/// Stage of the upload state machine in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Validating,
    Writing,
    Committing,
}

impl std::fmt::Display for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStage::Validating => "validating",
            UploadStage::Writing => "writing",
            UploadStage::Committing => "committing",
        };
        f.write_str(name)
    }
}

/// Errors produced by the imaging store.
#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("malformed dataset identifier {input:?}: {reason}")]
    MalformedIdentifier { input: String, reason: String },

    #[error("dataset {0} already exists")]
    DuplicateDataset(String),

    #[error("no decoder registered for format {0:?}")]
    UnsupportedFormat(String),

    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("frame {frame_index} metadata failed validation: {reason}")]
    MetadataValidation { frame_index: u32, reason: String },

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("permanent storage error: {0}")]
    Permanent(String),

    #[error("remote state of dataset {id} does not match its metadata: {detail}")]
    IncompleteRemoteState { id: String, detail: String },

    #[error("no complete dataset found for {0}")]
    DatasetNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("upload of {id} failed while {stage}")]
    UploadFailed {
        id: String,
        stage: UploadStage,
        #[source]
        source: Box<ImagingError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ImagingError {
    /// True if retrying the failed operation locally may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ImagingError::Transient(_))
    }
}
