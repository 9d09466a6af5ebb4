//! Framework configuration
//!
//! Resource caps, queue discipline, hash selection and disposition defaults
//! for the scanning engine. Plain serde structs with per-field defaults; rule
//! sources are loaded from the configured paths or supplied directly as
//! strings by the embedding service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};
use crate::object::HashKind;

/// Queue discipline for the scan driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    /// Breadth-first: siblings before grandchildren
    #[default]
    Bfs,
    /// Depth-first: follow each extraction chain to the bottom
    Dfs,
}

/// Verbosity of the returned scan report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Root flags and disposition only
    Minimal,
    /// Flags and metadata for every object
    #[default]
    Full,
    /// Full, explicitly without buffers (alias kept for configs that
    /// distinguish it from a future buffered default)
    NoBuffer,
    /// Full plus base64-encoded buffers
    Everything,
}

/// Scanning engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Path to the dispatch rule source
    #[serde(default)]
    pub dispatch_rules_path: Option<PathBuf>,
    /// Path to the disposition rule source
    #[serde(default)]
    pub disposition_rules_path: Option<PathBuf>,
    /// Maximum object depth; children below this are dropped
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Maximum objects per scan
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,
    /// Maximum total bytes across all objects in a scan
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Wall-clock budget for a whole scan, in milliseconds
    #[serde(default = "default_scan_time_ms")]
    pub scan_time_ms: u64,
    /// Default wall-clock budget per module invocation, in milliseconds
    #[serde(default = "default_module_time_ms")]
    pub module_time_ms: u64,
    /// Maximum size of a single emitted child
    #[serde(default = "default_max_child_size")]
    pub max_child_size: u64,
    /// Maximum children accepted from one module invocation
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Disposition used when no disposition rule matches
    #[serde(default = "default_disposition")]
    pub default_disposition: String,
    /// Buffer hash algorithm
    #[serde(default)]
    pub object_hash: HashKind,
    /// Module names that may re-run on descendants
    #[serde(default)]
    pub rescan_modules: Vec<String>,
    /// Queue discipline
    #[serde(default)]
    pub queue_order: QueueOrder,
    /// Numeric weights per flag, consulted by disposition rules
    #[serde(default)]
    pub flag_weights: indexmap::IndexMap<String, i64>,
    /// Report verbosity
    #[serde(default)]
    pub result_level: Verbosity,
}

fn default_max_depth() -> usize {
    10
}

fn default_max_objects() -> usize {
    1000
}

fn default_max_bytes() -> u64 {
    200 * 1024 * 1024 // 200MB
}

fn default_scan_time_ms() -> u64 {
    120_000
}

fn default_module_time_ms() -> u64 {
    30_000
}

fn default_max_child_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_max_children() -> usize {
    500
}

fn default_disposition() -> String {
    "Accept".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            dispatch_rules_path: None,
            disposition_rules_path: None,
            max_depth: default_max_depth(),
            max_objects: default_max_objects(),
            max_bytes: default_max_bytes(),
            scan_time_ms: default_scan_time_ms(),
            module_time_ms: default_module_time_ms(),
            max_child_size: default_max_child_size(),
            max_children: default_max_children(),
            default_disposition: default_disposition(),
            object_hash: HashKind::default(),
            rescan_modules: Vec::new(),
            queue_order: QueueOrder::default(),
            flag_weights: indexmap::IndexMap::new(),
            result_level: Verbosity::default(),
        }
    }
}

impl ScanConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_objects == 0 {
            return Err(EngineError::Config("max_objects cannot be 0".to_string()));
        }
        if self.max_bytes == 0 {
            return Err(EngineError::Config("max_bytes cannot be 0".to_string()));
        }
        if self.scan_time_ms == 0 {
            return Err(EngineError::Config("scan_time_ms cannot be 0".to_string()));
        }
        if self.module_time_ms == 0 {
            return Err(EngineError::Config("module_time_ms cannot be 0".to_string()));
        }
        if self.default_disposition.is_empty() {
            return Err(EngineError::Config(
                "default_disposition cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
