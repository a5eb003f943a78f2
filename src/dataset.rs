use crate::error::ImagingError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unique dataset identifier following the `<ID>-YYYY-MM-DD-HH-MM-SS-<XXXX>`
/// naming scheme: a project ID, the acquisition timestamp and a 4-digit serial.
///
/// The canonical string form round-trips through parse/format unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetIdentifier {
    project_id: String,
    acquired_at: NaiveDateTime,
    serial: u16,
}

/// Widths of the six timestamp fields in the identifier grammar.
const TIMESTAMP_FIELD_WIDTHS: [usize; 6] = [4, 2, 2, 2, 2, 2];

impl DatasetIdentifier {
    /// Construct an identifier from its parts.
    pub fn new(
        project_id: impl Into<String>,
        acquired_at: NaiveDateTime,
        serial: u16,
    ) -> Result<Self, ImagingError> {
        let project_id = project_id.into();
        if project_id.is_empty() {
            return Err(malformed(&project_id, "project ID must not be empty"));
        }
        if project_id.contains('-') {
            return Err(malformed(&project_id, "project ID must not contain hyphens"));
        }
        if serial > 9999 {
            return Err(malformed(
                &serial.to_string(),
                "serial must fit in 4 digits",
            ));
        }
        Ok(Self {
            project_id,
            acquired_at,
            serial,
        })
    }

    /// Parse the canonical string form.
    pub fn parse(input: &str) -> Result<Self, ImagingError> {
        let parts: Vec<&str> = input.split('-').collect();
        if parts.len() != 8 {
            return Err(malformed(
                input,
                "expected <ID>-YYYY-MM-DD-HH-MM-SS-<XXXX>",
            ));
        }
        if parts[0].is_empty() {
            return Err(malformed(input, "project ID must not be empty"));
        }
        for (field, width) in parts[1..7].iter().zip(TIMESTAMP_FIELD_WIDTHS) {
            if field.len() != width || !field.chars().all(|c| c.is_ascii_digit()) {
                return Err(malformed(
                    input,
                    "timestamp fields must be fixed-width numeric",
                ));
            }
        }
        if parts[7].len() != 4 || !parts[7].chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed(input, "serial must be exactly 4 digits"));
        }

        // Widths are checked above, so the numeric parses cannot fail.
        let year: i32 = parts[1].parse().unwrap();
        let month: u32 = parts[2].parse().unwrap();
        let day: u32 = parts[3].parse().unwrap();
        let hour: u32 = parts[4].parse().unwrap();
        let minute: u32 = parts[5].parse().unwrap();
        let second: u32 = parts[6].parse().unwrap();
        let serial: u16 = parts[7].parse().unwrap();

        let acquired_at = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .ok_or_else(|| malformed(input, "not a valid calendar timestamp"))?;

        Ok(Self {
            project_id: parts[0].to_string(),
            acquired_at,
            serial,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn acquired_at(&self) -> NaiveDateTime {
        self.acquired_at
    }

    pub fn serial(&self) -> u16 {
        self.serial
    }

    /// Object-store key namespace root for this dataset.
    ///
    /// Injective: two distinct identifiers never share a prefix because the
    /// canonical string round-trips.
    pub fn storage_prefix(&self) -> String {
        format!("datasets/{}", self)
    }
}

fn malformed(input: &str, reason: &str) -> ImagingError {
    ImagingError::MalformedIdentifier {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for DatasetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:04}",
            self.project_id,
            self.acquired_at.format("%Y-%m-%d-%H-%M-%S"),
            self.serial
        )
    }
}

impl FromStr for DatasetIdentifier {
    type Err = ImagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DatasetIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DatasetIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// How a dataset's source file was uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadType {
    /// The source file is stored as a single opaque blob.
    File,
    /// The source file is split into frames, one blob per frame.
    Frames,
}

impl UploadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadType::File => "file",
            UploadType::Frames => "frames",
        }
    }
}

impl FromStr for UploadType {
    type Err = ImagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(UploadType::File),
            "frames" => Ok(UploadType::Frames),
            other => Err(ImagingError::Manifest(format!(
                "upload_type should be 'file' or 'frames', not {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for UploadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a dataset record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    /// Upload in progress; blobs and metadata rows may be incomplete.
    Pending,
    /// All blobs and metadata rows are durably written.
    Complete,
    /// Upload failed; blobs are cleaned up, the record is kept as audit trail.
    Failed,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Pending => "pending",
            DatasetStatus::Complete => "complete",
            DatasetStatus::Failed => "failed",
        }
    }
}

impl FromStr for DatasetStatus {
    type Err = ImagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DatasetStatus::Pending),
            "complete" => Ok(DatasetStatus::Complete),
            "failed" => Ok(DatasetStatus::Failed),
            other => Err(ImagingError::Permanent(format!(
                "unknown dataset status {:?}",
                other
            ))),
        }
    }
}

/// One logical unit of uploaded imaging data.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetRecord {
    pub id: DatasetIdentifier,
    pub upload_type: UploadType,
    pub storage_prefix: String,
    pub status: DatasetStatus,
    pub description: Option<String>,
    pub global_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DatasetRecord {
    /// A fresh record at upload entry, before any blob is written.
    pub fn pending(
        id: DatasetIdentifier,
        upload_type: UploadType,
        description: Option<String>,
    ) -> Self {
        let storage_prefix = id.storage_prefix();
        Self {
            id,
            upload_type,
            storage_prefix,
            status: DatasetStatus::Pending,
            description,
            global_metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }
}

/// One decoded frame belonging to a dataset.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub dataset_id: DatasetIdentifier,
    pub frame_index: u32,
    pub storage_key: String,
    pub metadata: serde_json::Value,
}

/// Transient description of one requested upload. Not persisted.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub dataset_id: String,
    pub source_path: PathBuf,
    pub upload_type: UploadType,
    /// Declared splitter format for FRAMES uploads; inferred from the file
    /// extension when absent.
    pub format: Option<String>,
    pub metadata_schema: Option<serde_json::Value>,
    pub description: Option<String>,
}
