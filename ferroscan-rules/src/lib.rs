//! Ferroscan Rule Engine
//!
//! Compiles and evaluates a YARA-compatible rule subset against byte
//! buffers. The scanning framework uses it twice: dispatch rules select the
//! analysis modules to run against each scanned object, and disposition
//! rules fold the finished object tree's flags into a final verdict.
//!
//! # Architecture
//!
//! The engine follows the classic pipeline:
//!
//! 1. **Lex**: rule source is tokenized ([`lexer`])
//! 2. **Parse**: tokens become an AST ([`parser`], [`ast`])
//! 3. **Compile**: patterns are validated and lowered into a double-array
//!    Aho-Corasick automaton (plain literals) and compiled byte regexes
//!    (nocase, fullword, wildcard hex, regex) ([`compile`])
//! 4. **Scan**: both backends collect string hits, then each rule's
//!    condition is evaluated directly over the hit table ([`scan`])
//!
//! External variables (filename, content type, submission metadata, numeric
//! weights) are passed per scan via [`RuleInputs`] and referenced in
//! conditions as bare identifiers; undefined identifiers never satisfy a
//! condition.
//!
//! # Example
//!
//! ```
//! use ferroscan_rules::{compile, RuleInputs};
//!
//! let rules = r#"
//!     rule zip_archive {
//!         meta:
//!             scan_modules = "EXPLODE_ZIP,META_HASH"
//!         strings:
//!             $pk = { 50 4B 03 04 }
//!         condition:
//!             $pk at 0
//!     }
//! "#;
//!
//! let compiled = compile(rules)?;
//! let matches = compiled.scan(b"PK\x03\x04...", &RuleInputs::new());
//!
//! assert_eq!(matches[0].name.as_str(), "zip_archive");
//! # Ok::<(), ferroscan_rules::RuleError>(())
//! ```

pub mod ast;
pub mod compile;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod scan;

// Re-export key types
pub use ast::MetaValue;
pub use compile::{compile, CompiledRule, CompiledRules, PatternId};
pub use error::{RuleError, RuleResult};
pub use parser::parse;
pub use scan::{ExternalValue, RuleInputs, RuleMatch, StringHit, StringMatch};
