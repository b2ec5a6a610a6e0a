//! # Record Conversion
//!
//! Turns a batch of source records into the byte stream stored in the lake.
//! Conversion is a pure function of the schema key and the records; an empty
//! batch produces no output.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    #[error("no schema registered for '{schema_key}'")]
    UnknownSchema { schema_key: String },
    #[error("record {index} does not match schema '{schema_key}': {details}")]
    SchemaMismatch {
        schema_key: String,
        index: usize,
        details: String,
    },
    #[error("failed to encode records: {0}")]
    Encoding(String),
}

pub trait ColumnarConverter: Send + Sync {
    /// Encodes `records`; `Ok(None)` means there is nothing to write.
    fn convert(&self, schema_key: &str, records: &[JsonValue]) -> Result<Option<Vec<u8>>, ConvertError>;

    /// File extension of the produced partitions, without the dot.
    fn file_extension(&self) -> &'static str;
}

/// Newline-delimited JSON, one resource per line.
///
/// Each record must be a JSON object whose `resourceType` equals the schema
/// key, and the schema key must be one of the registered resource types.
#[derive(Debug, Clone)]
pub struct NdjsonConverter {
    schemas: BTreeSet<String>,
}

impl NdjsonConverter {
    pub fn new<I, S>(resource_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schemas: resource_types.into_iter().map(Into::into).collect(),
        }
    }
}

impl ColumnarConverter for NdjsonConverter {
    fn convert(&self, schema_key: &str, records: &[JsonValue]) -> Result<Option<Vec<u8>>, ConvertError> {
        if !self.schemas.contains(schema_key) {
            return Err(ConvertError::UnknownSchema {
                schema_key: schema_key.to_string(),
            });
        }
        if records.is_empty() {
            return Ok(None);
        }

        let mut out = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let resource_type = record.get("resourceType").and_then(JsonValue::as_str);
            if resource_type != Some(schema_key) {
                return Err(ConvertError::SchemaMismatch {
                    schema_key: schema_key.to_string(),
                    index,
                    details: format!("resourceType is {resource_type:?}"),
                });
            }
            serde_json::to_writer(&mut out, record).map_err(|e| ConvertError::Encoding(e.to_string()))?;
            out.push(b'\n');
        }

        Ok(Some(out))
    }

    fn file_extension(&self) -> &'static str {
        "ndjson"
    }
}
