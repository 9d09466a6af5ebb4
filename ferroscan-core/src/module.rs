//! Module contract and registry
//!
//! An analysis module is a named implementation of [`ScanModule`] registered
//! at build time; dispatch references modules by name and the runtime looks
//! them up in the [`ModuleRegistry`]. Modules receive the current object
//! read-only and return their effects as a [`ModuleOutput`]; the runtime
//! commits outputs only for successful, in-budget invocations.

use indexmap::IndexMap;
use smol_str::SmolStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ModuleError, ModuleResult};
use crate::metadata::MetaValue;
use crate::object::{ExternalVars, ScanObject};

/// Cooperative time budget for one module invocation
///
/// Long-running loops should call [`Deadline::check`] periodically and bail
/// out with `ModuleError::Timeout`; the runtime also measures wall-clock on
/// return and discards over-budget output.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// A deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            end: Instant::now() + budget,
        }
    }

    /// Whether the budget is exhausted
    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// Error out if the budget is exhausted
    pub fn check(&self) -> ModuleResult<()> {
        if self.expired() {
            Err(ModuleError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// String-valued module options
///
/// Options merge in three layers: module-table defaults, then the dispatch
/// action's overrides, then per-scan overrides. Later layers win per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleOptions {
    values: IndexMap<SmolStr, String>,
}

impl ModuleOptions {
    /// Create an empty option set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option
    pub fn set(&mut self, key: impl Into<SmolStr>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style set
    pub fn with(mut self, key: impl Into<SmolStr>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Look up an option as a string
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up an option as an integer
    pub fn get_int(&self, key: &str) -> ModuleResult<Option<i64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| {
                ModuleError::InvalidOptions(format!("option '{}' is not an integer: {}", key, raw))
            }),
        }
    }

    /// Look up an option as a boolean (`true`/`false`/`1`/`0`)
    pub fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.values.get(key).map(String::as_str) {
            None => Ok(None),
            Some("true") | Some("1") => Ok(Some(true)),
            Some("false") | Some("0") => Ok(Some(false)),
            Some(raw) => Err(ModuleError::InvalidOptions(format!(
                "option '{}' is not a boolean: {}",
                key, raw
            ))),
        }
    }

    /// Overlay another option set; its entries win per key
    pub fn overlay(&mut self, other: &ModuleOptions) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Number of options
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A child object emitted by a module
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Extracted bytes
    pub buffer: Vec<u8>,
    /// Name assigned by the producing module, if any
    pub filename: Option<String>,
}

impl ChildSpec {
    /// Create a child from extracted bytes
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            filename: None,
        }
    }

    /// Assign a filename
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Effects returned by one module invocation
#[derive(Debug, Clone, Default)]
pub struct ModuleOutput {
    /// Extracted child objects
    pub children: Vec<ChildSpec>,
    /// Flags to add to the scanned object
    pub flags: Vec<SmolStr>,
    /// Fields to commit into the module's metadata namespace
    pub metadata: Vec<(SmolStr, MetaValue)>,
}

impl ModuleOutput {
    /// Create an empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flag
    pub fn add_flag(&mut self, flag: impl Into<SmolStr>) {
        self.flags.push(flag.into());
    }

    /// Add a metadata field
    pub fn add_metadata(&mut self, field: impl Into<SmolStr>, value: impl Into<MetaValue>) {
        self.metadata.push((field.into(), value.into()));
    }

    /// Add a child object
    pub fn add_child(&mut self, child: ChildSpec) {
        self.children.push(child);
    }
}

/// Execution context lent to a module for one invocation
pub struct ModuleContext<'a> {
    /// Submission envelope
    pub external: &'a ExternalVars,
    /// Merged options for this invocation
    pub options: ModuleOptions,
    /// Depth of the object being scanned
    pub depth: usize,
    /// Cooperative time budget
    pub deadline: Deadline,
}

/// An analysis module
///
/// Implementations must not hold mutable state across invocations; one
/// registry is shared by every scan.
pub trait ScanModule: Send + Sync {
    /// Registry name, referenced by dispatch actions
    fn name(&self) -> &'static str;

    /// Analyze one object
    fn scan(&self, object: &ScanObject, ctx: &ModuleContext<'_>) -> ModuleResult<ModuleOutput>;
}

/// Static per-module defaults from the module table
#[derive(Debug, Clone)]
pub struct ModuleDefaults {
    /// Disabled modules are skipped at dispatch
    pub enabled: bool,
    /// Default options, lowest-precedence layer of the merge
    pub options: ModuleOptions,
    /// Per-module override of the default time budget, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Per-module override of the child-count cap
    pub max_children: Option<usize>,
}

impl Default for ModuleDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            options: ModuleOptions::new(),
            timeout_ms: None,
            max_children: None,
        }
    }
}

/// A registered module with its defaults
#[derive(Clone)]
pub struct ModuleEntry {
    /// The implementation
    pub module: Arc<dyn ScanModule>,
    /// Static defaults
    pub defaults: ModuleDefaults,
}

/// Name-keyed module table
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    entries: IndexMap<SmolStr, ModuleEntry>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module with default settings
    pub fn register(&mut self, module: Arc<dyn ScanModule>) {
        self.register_with(module, ModuleDefaults::default());
    }

    /// Register a module with explicit defaults
    pub fn register_with(&mut self, module: Arc<dyn ScanModule>, defaults: ModuleDefaults) {
        let name = SmolStr::new(module.name());
        self.entries.insert(name, ModuleEntry { module, defaults });
    }

    /// Look up a module by name
    pub fn get(&self, name: &str) -> Option<&ModuleEntry> {
        self.entries.get(name)
    }

    /// Whether a module is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered module names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &SmolStr> {
        self.entries.keys()
    }

    /// Number of registered modules
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
