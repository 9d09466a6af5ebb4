//! Built-in analysis modules
//!
//! The framework ships a small set of metadata modules; format-specific
//! extractors register alongside them in the deployment's module table.

pub mod hash;
pub mod math;
pub mod yara;

use std::sync::Arc;

use crate::module::ModuleRegistry;

pub use hash::MetaHash;
pub use math::MetaMath;
pub use yara::ScanYara;

/// A registry preloaded with the built-in metadata modules
///
/// `SCAN_YARA` is not included: it needs a content ruleset, so deployments
/// construct and register it explicitly.
pub fn builtin_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(Arc::new(MetaHash));
    registry.register(Arc::new(MetaMath));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contents() {
        let registry = builtin_registry();
        assert!(registry.contains("META_HASH"));
        assert!(registry.contains("META_MATH"));
        assert!(!registry.contains("SCAN_YARA"));
    }
}
