//! Error types for the scanning framework
//!
//! The split follows the framework's fault policy: [`EngineError`] is for
//! configuration and framework faults and surfaces at startup (or, for
//! `Internal`, aborts a scan); [`ModuleError`] is for faults inside analysis
//! modules and is converted into flags and metadata, never propagated out of
//! a scan.

use thiserror::Error;

/// Framework errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Rule error: {0}")]
    Rule(#[from] ferroscan_rules::RuleError),

    #[error("Dispatch configuration error: {0}")]
    DispatchConfig(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal framework error: {0}")]
    Internal(String),
}

/// Result type for framework operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Module execution errors
///
/// Returned by [`crate::module::ScanModule::scan`]; the runtime records them
/// on the object and continues with the next module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module exceeded its time budget")]
    Timeout,

    #[error("invalid module options: {0}")]
    InvalidOptions(String),

    #[error("module failed: {0}")]
    Failed(String),
}

/// Result type for module execution
pub type ModuleResult<T> = Result<T, ModuleError>;
