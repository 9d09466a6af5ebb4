//! Scan reports
//!
//! The wire shape of a finished scan: a camelCase JSON document keyed by
//! object UUID. Verbosity selects how much of the tree is projected;
//! buffers are base64-encoded and appear only at `Everything`. Numeric
//! fields are emitted as numbers.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::Verbosity;
use crate::disposition::DISPOSITIONER;
use crate::error::{EngineError, EngineResult};
use crate::object::ScanObject;

/// Projection of one scan object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub hash: String,
    pub size: u64,
    #[serde(rename = "objectType")]
    pub object_type: Vec<String>,
    #[serde(rename = "contentType")]
    pub content_type: Vec<String>,
    pub flags: Vec<String>,
    #[serde(rename = "scanModules")]
    pub scan_modules: Vec<String>,
    #[serde(default, rename = "sourceModule", skip_serializing_if = "Option::is_none")]
    pub source_module: Option<String>,
    pub metadata: JsonValue,
    /// Base64-encoded buffer, present only at `Everything`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
}

/// The returned artifact of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(rename = "rootUID")]
    pub root_uid: String,
    pub source: String,
    pub level: Verbosity,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    /// Object projections keyed by uuid
    pub files: IndexMap<String, FileRecord>,
}

impl ScanReport {
    /// Project a finished object tree at the requested verbosity
    ///
    /// The root object must be first, as produced by the driver.
    pub fn build(
        objects: &[ScanObject],
        source: impl Into<String>,
        start_time: DateTime<Utc>,
        level: Verbosity,
    ) -> Self {
        let root_uid = objects
            .first()
            .map(|root| root.uuid.to_string())
            .unwrap_or_default();

        let selected: &[ScanObject] = match level {
            Verbosity::Minimal => &objects[..objects.len().min(1)],
            _ => objects,
        };

        let files = selected
            .iter()
            .map(|object| (object.uuid.to_string(), project(object, level)))
            .collect();

        Self {
            root_uid,
            source: source.into(),
            level,
            start_time,
            files,
        }
    }

    /// The root object's projection
    pub fn root(&self) -> Option<&FileRecord> {
        self.files.get(&self.root_uid)
    }

    /// The final verdict, read from the root's dispositioner namespace
    pub fn disposition(&self) -> Option<&str> {
        self.root()?
            .metadata
            .get(DISPOSITIONER)?
            .get("Disposition")?
            .get("Result")?
            .as_str()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Internal(e.to_string()))
    }
}

/// Project one object at the requested verbosity
fn project(object: &ScanObject, level: Verbosity) -> FileRecord {
    let metadata = match level {
        // Minimal keeps the verdict namespace only
        Verbosity::Minimal => {
            let mut kept = serde_json::Map::new();
            if let Some(ns) = object.metadata.get(DISPOSITIONER) {
                kept.insert(DISPOSITIONER.to_string(), namespace_json(ns));
            }
            JsonValue::Object(kept)
        }
        _ => JsonValue::Object(
            object
                .metadata
                .iter()
                .map(|(module, ns)| (module.to_string(), namespace_json(ns)))
                .collect(),
        ),
    };

    let buffer = match level {
        Verbosity::Everything => Some(
            base64::engine::general_purpose::STANDARD.encode(object.buffer()),
        ),
        _ => None,
    };

    FileRecord {
        uuid: object.uuid.to_string(),
        parent: object.parent_uuid.map(|uuid| uuid.to_string()),
        depth: object.depth,
        filename: object.filename.clone(),
        hash: object.object_hash.clone(),
        size: object.object_size,
        object_type: object.object_type.iter().map(|s| s.to_string()).collect(),
        content_type: object.content_type.iter().map(|s| s.to_string()).collect(),
        flags: object.flags.iter().map(|s| s.to_string()).collect(),
        scan_modules: object.scan_modules.iter().map(|s| s.to_string()).collect(),
        source_module: object.source_module.as_ref().map(|s| s.to_string()),
        metadata,
        buffer,
    }
}

fn namespace_json(
    namespace: &IndexMap<smol_str::SmolStr, crate::metadata::MetaValue>,
) -> JsonValue {
    JsonValue::Object(
        namespace
            .iter()
            .map(|(field, value)| (field.to_string(), value.to_json()))
            .collect(),
    )
}
