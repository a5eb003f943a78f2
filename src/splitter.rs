use crate::error::ImagingError;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// One decoded frame: its position in the source file, its encoded bytes and
/// the metadata extracted for it.
#[derive(Debug, Clone)]
pub struct SplitFrame {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub metadata: Value,
}

/// Decoder for one composite file format.
///
/// Implementations must yield frames in ascending index order starting at 0,
/// and must be deterministic: splitting the same bytes twice yields the same
/// frames.
pub trait FrameDecoder: Send + Sync {
    /// Format name the decoder is registered under.
    fn format(&self) -> &'static str;

    /// Cut the file into frames.
    fn split(&self, data: &[u8]) -> Result<Vec<SplitFrame>, ImagingError>;
}

/// A single validation failure for one metadata document.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub key: String,
    pub reason: String,
}

/// Schema-validation capability: a schema handle plus an untyped document in,
/// a structured list of failures out. Decoupled from any one schema library.
pub trait MetadataValidator: Send + Sync {
    fn validate(&self, schema: &Value, document: &Value) -> Vec<ValidationFailure>;
}

/// Built-in validator understanding a JSON-schema-like document with
/// `required` keys and primitive `properties` types.
#[derive(Debug, Default)]
pub struct SchemaValidator;

impl MetadataValidator for SchemaValidator {
    fn validate(&self, schema: &Value, document: &Value) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();

        let object = match document.as_object() {
            Some(object) => object,
            None => {
                failures.push(ValidationFailure {
                    key: String::new(),
                    reason: "metadata document is not an object".to_string(),
                });
                return failures;
            }
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    failures.push(ValidationFailure {
                        key: key.to_string(),
                        reason: "required key is missing".to_string(),
                    });
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, property) in properties {
                let expected = match property.get("type").and_then(Value::as_str) {
                    Some(expected) => expected,
                    None => continue,
                };
                let value = match object.get(key) {
                    Some(value) => value,
                    None => continue,
                };
                if !type_matches(expected, value) {
                    failures.push(ValidationFailure {
                        key: key.clone(),
                        reason: format!("expected type {}", expected),
                    });
                }
            }
        }

        failures
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Registry mapping declared formats to decoders, with metadata validation
/// applied before any frame is handed to the caller.
pub struct SplitterRegistry {
    decoders: HashMap<String, Box<dyn FrameDecoder>>,
    validator: Box<dyn MetadataValidator>,
}

impl SplitterRegistry {
    /// Registry with the built-in decoders and validator.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
            validator: Box::new(SchemaValidator),
        };
        registry.register(Box::new(PngStackDecoder));
        registry
    }

    pub fn register(&mut self, decoder: Box<dyn FrameDecoder>) {
        self.decoders
            .insert(decoder.format().to_ascii_lowercase(), decoder);
    }

    pub fn set_validator(&mut self, validator: Box<dyn MetadataValidator>) {
        self.validator = validator;
    }

    /// Split `data` using the decoder registered for `declared_format`.
    ///
    /// If a schema is supplied, every frame's metadata must validate against
    /// it; the first failure fails the whole split and no partial result is
    /// surfaced.
    pub fn split(
        &self,
        data: &[u8],
        declared_format: &str,
        schema: Option<&Value>,
    ) -> Result<Vec<SplitFrame>, ImagingError> {
        let decoder = self
            .decoders
            .get(&declared_format.to_ascii_lowercase())
            .ok_or_else(|| ImagingError::UnsupportedFormat(declared_format.to_string()))?;

        let frames = decoder.split(data)?;

        for (position, frame) in frames.iter().enumerate() {
            if frame.index as usize != position {
                return Err(ImagingError::CorruptInput(format!(
                    "decoder produced frame index {} at position {}",
                    frame.index, position
                )));
            }
        }

        if let Some(schema) = schema {
            for frame in &frames {
                let failures = self.validator.validate(schema, &frame.metadata);
                if !failures.is_empty() {
                    let reason = failures
                        .iter()
                        .map(|f| {
                            if f.key.is_empty() {
                                f.reason.clone()
                            } else {
                                format!("{}: {}", f.key, f.reason)
                            }
                        })
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(ImagingError::MetadataValidation {
                        frame_index: frame.index,
                        reason,
                    });
                }
            }
        }

        debug!(
            format = declared_format,
            frames = frames.len(),
            "Split input into frames"
        );

        Ok(frames)
    }
}

impl Default for SplitterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Splits a concatenation of PNG images into one frame per image.
///
/// Frame boundaries are found by walking chunk lengths up to each IEND chunk;
/// pixel data is never decoded. Per-frame metadata comes from the IHDR header.
pub struct PngStackDecoder;

impl FrameDecoder for PngStackDecoder {
    fn format(&self) -> &'static str {
        "png-stack"
    }

    fn split(&self, data: &[u8]) -> Result<Vec<SplitFrame>, ImagingError> {
        if data.is_empty() {
            return Err(ImagingError::CorruptInput("empty input".to_string()));
        }

        let mut frames = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = png_end(data, offset)?;
            let bytes = data[offset..end].to_vec();
            let metadata = ihdr_metadata(&bytes)?;
            frames.push(SplitFrame {
                index: frames.len() as u32,
                bytes,
                metadata,
            });
            offset = end;
        }
        Ok(frames)
    }
}

/// Walk chunks from `start` and return the offset just past the IEND chunk.
fn png_end(data: &[u8], start: usize) -> Result<usize, ImagingError> {
    let sig_end = start + PNG_SIGNATURE.len();
    if data.len() < sig_end || data[start..sig_end] != PNG_SIGNATURE {
        return Err(ImagingError::CorruptInput(format!(
            "missing PNG signature at offset {}",
            start
        )));
    }

    let mut pos = sig_end;
    loop {
        if pos + 8 > data.len() {
            return Err(ImagingError::CorruptInput(format!(
                "truncated chunk header at offset {}",
                pos
            )));
        }
        let length = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let chunk_type = &data[pos + 4..pos + 8];
        let chunk_end = pos
            .checked_add(8 + length + 4)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                ImagingError::CorruptInput(format!("truncated chunk at offset {}", pos))
            })?;
        if chunk_type == b"IEND" {
            return Ok(chunk_end);
        }
        pos = chunk_end;
    }
}

/// Extract width, height, bit depth and color information from the IHDR chunk
/// of a single PNG image.
fn ihdr_metadata(png: &[u8]) -> Result<Value, ImagingError> {
    let header_start = PNG_SIGNATURE.len();
    if png.len() < header_start + 8 + 13 {
        return Err(ImagingError::CorruptInput(
            "image too short for IHDR".to_string(),
        ));
    }
    if &png[header_start + 4..header_start + 8] != b"IHDR" {
        return Err(ImagingError::CorruptInput(
            "first chunk is not IHDR".to_string(),
        ));
    }
    let d = &png[header_start + 8..];
    let width = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
    let height = u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
    let bit_depth = d[8];
    let color_type = d[9];
    let channels = match color_type {
        0 | 3 => 1,
        2 => 3,
        4 => 2,
        6 => 4,
        other => {
            return Err(ImagingError::CorruptInput(format!(
                "unknown PNG color type {}",
                other
            )))
        }
    };

    Ok(json!({
        "width": width,
        "height": height,
        "bit_depth": bit_depth,
        "color_type": color_type,
        "channels": channels,
    }))
}
