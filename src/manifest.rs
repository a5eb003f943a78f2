use crate::dataset::{UploadRequest, UploadType};
use crate::error::ImagingError;
use std::path::{Path, PathBuf};

/// One row of the uploader's csv manifest.
///
/// Required columns: `dataset_id`, `file_name`, `upload_type`. Optional:
/// `format`, `meta_schema` (path to a JSON schema file) and `description`.
#[derive(Debug, Clone)]
pub struct ManifestRow {
    pub dataset_id: String,
    pub file_name: PathBuf,
    pub upload_type: UploadType,
    pub format: Option<String>,
    pub meta_schema: Option<PathBuf>,
    pub description: Option<String>,
}

impl ManifestRow {
    /// Turn the row into an upload request, reading the schema file if one
    /// is referenced.
    pub fn into_request(self) -> Result<UploadRequest, ImagingError> {
        let metadata_schema = match &self.meta_schema {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Some(serde_json::from_str(&raw).map_err(|e| {
                    ImagingError::Manifest(format!(
                        "invalid metadata schema {}: {}",
                        path.display(),
                        e
                    ))
                })?)
            }
            None => None,
        };
        Ok(UploadRequest {
            dataset_id: self.dataset_id,
            source_path: self.file_name,
            upload_type: self.upload_type,
            format: self.format,
            metadata_schema,
            description: self.description,
        })
    }
}

/// Read and parse a manifest file.
pub async fn load_manifest(path: &Path) -> Result<Vec<ManifestRow>, ImagingError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_manifest(&text)
}

/// Parse manifest text. Columns are addressed by header name; field values
/// are plain (no quoting), matching the simple manifests the uploader has
/// always consumed.
pub fn parse_manifest(text: &str) -> Result<Vec<ManifestRow>, ImagingError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header) = lines
        .next()
        .ok_or_else(|| ImagingError::Manifest("manifest is empty".to_string()))?;
    let columns: Vec<String> = header
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .collect();

    let column = |name: &str| columns.iter().position(|c| c == name);
    let required = |name: &str| {
        column(name)
            .ok_or_else(|| ImagingError::Manifest(format!("missing required column {}", name)))
    };

    let dataset_id_col = required("dataset_id")?;
    let file_name_col = required("file_name")?;
    let upload_type_col = required("upload_type")?;
    let format_col = column("format");
    let meta_schema_col = column("meta_schema");
    let description_col = column("description");

    let mut rows = Vec::new();
    for (line_idx, line) in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != columns.len() {
            return Err(ImagingError::Manifest(format!(
                "line {}: expected {} fields, got {}",
                line_idx + 1,
                columns.len(),
                fields.len()
            )));
        }

        let get = |col: Option<usize>| -> Option<String> {
            col.and_then(|i| fields.get(i))
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };

        let dataset_id = get(Some(dataset_id_col)).ok_or_else(|| {
            ImagingError::Manifest(format!("line {}: dataset_id is empty", line_idx + 1))
        })?;
        let file_name = get(Some(file_name_col)).ok_or_else(|| {
            ImagingError::Manifest(format!("line {}: file_name is empty", line_idx + 1))
        })?;
        let upload_type = fields[upload_type_col].parse::<UploadType>()?;

        rows.push(ManifestRow {
            dataset_id,
            file_name: PathBuf::from(file_name),
            upload_type,
            format: get(format_col),
            meta_schema: get(meta_schema_col).map(PathBuf::from),
            description: get(description_col),
        });
    }

    Ok(rows)
}
