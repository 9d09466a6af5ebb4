//! Scan object model
//!
//! A scan produces a tree of [`ScanObject`]s: the root buffer and every
//! artifact extracted from it. Objects reference their parent and root by
//! UUID; the driver owns the tree as an arena, so there are no owning
//! pointers between objects.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use md5::Digest as _;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::metadata::MetaValue;

/// Metadata namespace that collects module failures
pub const SCAN_FAILURES: &str = "SCAN_FAILURES";

/// Buffer hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl HashKind {
    /// Hex digest of a buffer
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            HashKind::Md5 => hex::encode(md5::Md5::digest(data)),
            HashKind::Sha1 => hex::encode(sha1::Sha1::digest(data)),
            HashKind::Sha256 => hex::encode(sha2::Sha256::digest(data)),
        }
    }
}

/// Submission envelope
///
/// Carried unchanged through the scan and visible to every module and to
/// rule conditions. `rescan` lists module names that may run again on
/// descendants of an object that already ran them.
#[derive(Debug, Clone)]
pub struct ExternalVars {
    /// Free-form origin tag
    pub source: String,
    /// Correlation id across a conversation
    pub eph_id: String,
    /// Unique id for this submission
    pub submit_id: String,
    /// Source tags supplied by the submitter
    pub ext_source_tags: Vec<String>,
    /// Submitter-supplied metadata
    pub ext_metadata: IndexMap<String, String>,
    /// Original filename, if known
    pub filename: Option<String>,
    /// Declared content type, if known
    pub content_type: Option<String>,
    /// Submission timestamp
    pub timestamp: DateTime<Utc>,
    /// Module names that may re-run on descendants
    pub rescan: Vec<SmolStr>,
}

impl ExternalVars {
    /// Create an envelope with a fresh submit id
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            eph_id: String::new(),
            submit_id: Uuid::new_v4().to_string(),
            ext_source_tags: Vec::new(),
            ext_metadata: IndexMap::new(),
            filename: None,
            content_type: None,
            timestamp: Utc::now(),
            rescan: Vec::new(),
        }
    }

    /// Set the correlation id
    pub fn with_eph_id(mut self, eph_id: impl Into<String>) -> Self {
        self.eph_id = eph_id.into();
        self
    }

    /// Set the original filename
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Set the declared content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a source tag
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.ext_source_tags.push(tag.into());
        self
    }

    /// Add a submitter metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_metadata.insert(key.into(), value.into());
        self
    }

    /// Allow a module to re-run on descendants
    pub fn with_rescan(mut self, module: impl Into<SmolStr>) -> Self {
        self.rescan.push(module.into());
        self
    }

    /// Whether a module is on the rescan list
    pub fn may_rescan(&self, module: &str) -> bool {
        self.rescan.iter().any(|m| m == module)
    }
}

impl Default for ExternalVars {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// One node of the scan tree
///
/// The buffer is read-only after construction; hash and size are computed
/// once and never change. Flags grow monotonically and duplicates are
/// idempotent. Metadata is namespaced per module.
#[derive(Debug, Clone)]
pub struct ScanObject {
    buffer: Vec<u8>,
    /// Unique id of this object
    pub uuid: Uuid,
    /// Producing object, None for the root
    pub parent_uuid: Option<Uuid>,
    /// Root of this scan tree
    pub root_uuid: Uuid,
    /// Root is 0, children are parent + 1
    pub depth: usize,
    /// Inherited or assigned by the producing module
    pub filename: Option<String>,
    /// Hex digest of the buffer
    pub object_hash: String,
    /// Byte length of the buffer
    pub object_size: u64,
    /// Dispatch rule names that matched this object
    pub object_type: Vec<SmolStr>,
    /// Accumulated flags, insertion-ordered, duplicate-free
    pub flags: Vec<SmolStr>,
    /// Module-namespaced findings
    pub metadata: IndexMap<SmolStr, IndexMap<SmolStr, MetaValue>>,
    /// Modules executed against this object, in order
    pub scan_modules: Vec<SmolStr>,
    /// Content types assigned during dispatch
    pub content_type: Vec<SmolStr>,
    /// Module that produced this object, None for the root
    pub source_module: Option<SmolStr>,
}

impl ScanObject {
    /// Construct the root object of a scan
    pub fn root(buffer: Vec<u8>, external: &ExternalVars, hash: HashKind) -> Self {
        let uuid = Uuid::new_v4();
        let object_hash = hash.digest(&buffer);
        let object_size = buffer.len() as u64;

        Self {
            buffer,
            uuid,
            parent_uuid: None,
            root_uuid: uuid,
            depth: 0,
            filename: external.filename.clone(),
            object_hash,
            object_size,
            object_type: Vec::new(),
            flags: Vec::new(),
            metadata: IndexMap::new(),
            scan_modules: Vec::new(),
            content_type: Vec::new(),
            source_module: None,
        }
    }

    /// Construct a child object extracted from `parent`
    pub fn child(
        buffer: Vec<u8>,
        parent: &ScanObject,
        source_module: impl Into<SmolStr>,
        filename: Option<String>,
        hash: HashKind,
    ) -> Self {
        let object_hash = hash.digest(&buffer);
        let object_size = buffer.len() as u64;

        Self {
            buffer,
            uuid: Uuid::new_v4(),
            parent_uuid: Some(parent.uuid),
            root_uuid: parent.root_uuid,
            depth: parent.depth + 1,
            filename: filename.or_else(|| parent.filename.clone()),
            object_hash,
            object_size,
            object_type: Vec::new(),
            flags: Vec::new(),
            metadata: IndexMap::new(),
            scan_modules: Vec::new(),
            content_type: Vec::new(),
            source_module: Some(source_module.into()),
        }
    }

    /// Read view of the buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Add a flag; duplicates are ignored
    pub fn add_flag(&mut self, flag: impl Into<SmolStr>) {
        let flag = flag.into();
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    /// Whether a flag is present
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Record a matched dispatch rule name
    pub fn add_object_type(&mut self, name: impl Into<SmolStr>) {
        let name = name.into();
        if !self.object_type.contains(&name) {
            self.object_type.push(name);
        }
    }

    /// Record a content type assigned during dispatch
    pub fn add_content_type(&mut self, name: impl Into<SmolStr>) {
        let name = name.into();
        if !self.content_type.contains(&name) {
            self.content_type.push(name);
        }
    }

    /// Write a metadata field in a module's namespace
    ///
    /// Later writes to the same field replace the earlier value; other
    /// modules' namespaces are never touched.
    pub fn add_metadata(
        &mut self,
        module: impl Into<SmolStr>,
        field: impl Into<SmolStr>,
        value: MetaValue,
    ) {
        self.metadata
            .entry(module.into())
            .or_default()
            .insert(field.into(), value);
    }

    /// Read a metadata field
    pub fn metadata_get(&self, module: &str, field: &str) -> Option<&MetaValue> {
        self.metadata.get(module).and_then(|ns| ns.get(field))
    }

    /// Append a module failure record to the `SCAN_FAILURES` namespace
    pub fn record_failure(&mut self, module: &str, error: &str, traceback: &str) {
        let mut entry = IndexMap::new();
        entry.insert(SmolStr::new("module"), MetaValue::from(module));
        entry.insert(SmolStr::new("error"), MetaValue::from(error));
        entry.insert(SmolStr::new("traceback"), MetaValue::from(traceback));

        let failures = self
            .metadata
            .entry(SmolStr::new(SCAN_FAILURES))
            .or_default()
            .entry(SmolStr::new("failures"))
            .or_insert_with(|| MetaValue::List(Vec::new()));

        if let MetaValue::List(items) = failures {
            items.push(MetaValue::Map(entry));
        }
    }

    /// Record that a module ran against this object
    pub fn record_module_run(&mut self, name: impl Into<SmolStr>) {
        self.scan_modules.push(name.into());
    }

    /// Whether a module already ran against this object
    pub fn has_run(&self, name: &str) -> bool {
        self.scan_modules.iter().any(|m| m == name)
    }
}
