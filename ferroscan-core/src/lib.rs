//! Ferroscan Core
//!
//! A recursive object-scanning framework for file-centric intrusion
//! detection. A byte buffer goes in; out comes a tree of scan objects, the
//! input and every nested artifact discovered inside it, each annotated
//! with flags and metadata, and the whole tree folded into a final
//! disposition (Accept, Quarantine, Reject, ...).
//!
//! # Architecture
//!
//! One scan flows through six cooperating pieces:
//!
//! 1. **Object model** ([`object`]): [`ScanObject`] nodes carry the buffer,
//!    lineage (uuid / parent / root / depth), flags and per-module metadata.
//! 2. **Rule engine** (`ferroscan-rules`): YARA-compatible matching that
//!    drives both dispatch and disposition.
//! 3. **Dispatcher** ([`dispatch`]): matches dispatch rules against each
//!    object and resolves the ordered module list from the action table.
//! 4. **Module runtime** ([`runtime`] via the engine): runs each module
//!    under a time budget, traps failures into flags and metadata, and
//!    admits emitted children against the scan's resource caps.
//! 5. **Dispositioner** ([`disposition`]): folds the flags of the finished
//!    tree into a verdict using a second rule table.
//! 6. **Scan driver** ([`engine`]): the queue loop tying it all together,
//!    plus report shaping ([`result`]).
//!
//! Analysis modules implement the [`ScanModule`] trait and are registered by
//! name in a [`ModuleRegistry`]; a handful of built-ins live in [`modules`].
//! Concurrency across scans belongs to the caller: one engine may be shared
//! by many worker threads, one scan per call, with no shared mutable state.
//!
//! # Example
//!
//! ```
//! use ferroscan_core::{builtin_registry, ExternalVars, ScanConfig, ScanEngine};
//!
//! let dispatch = r#"
//!     rule zip_archive {
//!         meta:
//!             scan_modules = "META_HASH,META_MATH"
//!             flags = "archive"
//!         strings:
//!             $pk = { 50 4B 03 04 }
//!         condition:
//!             $pk at 0
//!     }
//! "#;
//!
//! let disposition = r#"
//!     rule reject_malicious {
//!         meta:
//!             disposition = "Reject"
//!             reason = "malicious content"
//!         strings:
//!             $f = "MALICIOUS"
//!         condition:
//!             $f
//!     }
//! "#;
//!
//! let engine = ScanEngine::new(
//!     ScanConfig::default(),
//!     builtin_registry(),
//!     dispatch,
//!     disposition,
//! )?;
//!
//! let report = engine.scan(b"PK\x03\x04payload".to_vec(), ExternalVars::new("mail"))?;
//! assert_eq!(report.disposition(), Some("Accept"));
//! # Ok::<(), ferroscan_core::EngineError>(())
//! ```

pub mod config;
pub mod dispatch;
pub mod disposition;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod module;
pub mod modules;
pub mod object;
pub mod result;

mod runtime;

// Re-export key types
pub use config::{QueueOrder, ScanConfig, Verbosity};
pub use dispatch::{DispatchAction, DispatchTable, ModuleInvocation};
pub use disposition::{Disposition, Dispositioner, DISPOSITIONER};
pub use engine::ScanEngine;
pub use error::{EngineError, EngineResult, ModuleError, ModuleResult};
pub use metadata::MetaValue;
pub use module::{
    ChildSpec, Deadline, ModuleContext, ModuleDefaults, ModuleOptions, ModuleOutput,
    ModuleRegistry, ScanModule,
};
pub use modules::builtin_registry;
pub use object::{ExternalVars, HashKind, ScanObject, SCAN_FAILURES};
pub use result::{FileRecord, ScanReport};
