//! SCAN_YARA module
//!
//! Matches a content-oriented ruleset (distinct from the dispatch table)
//! against the object buffer. Matched rule names become flags on the object,
//! prefixed `YARA:`, or the rule's `meta.flag` value verbatim when one is
//! declared. Match names are also recorded in the module's metadata
//! namespace.

use ferroscan_rules::CompiledRules;
use smol_str::SmolStr;

use crate::dispatch::rule_inputs;
use crate::error::{EngineResult, ModuleResult};
use crate::metadata::MetaValue;
use crate::module::{ModuleContext, ModuleOutput, ScanModule};
use crate::object::ScanObject;

/// Content rule-matching module
pub struct ScanYara {
    rules: CompiledRules,
}

impl ScanYara {
    /// Compile a content ruleset
    pub fn new(source: &str) -> EngineResult<Self> {
        Ok(Self {
            rules: ferroscan_rules::compile(source)?,
        })
    }

    /// Number of compiled rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl ScanModule for ScanYara {
    fn name(&self) -> &'static str {
        "SCAN_YARA"
    }

    fn scan(&self, object: &ScanObject, ctx: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
        let inputs = rule_inputs(object, ctx.external);
        let matches = self.rules.scan(object.buffer(), &inputs);

        let mut output = ModuleOutput::new();
        let mut names = Vec::with_capacity(matches.len());

        for matched in &matches {
            let flag = matched
                .meta
                .iter()
                .find(|(key, _)| key == "flag")
                .and_then(|(_, value)| value.as_str())
                .map(SmolStr::new)
                .unwrap_or_else(|| SmolStr::new(format!("YARA:{}", matched.name)));
            output.add_flag(flag);
            names.push(MetaValue::from(matched.name.to_string()));
        }

        if !names.is_empty() {
            output.add_metadata("matches", MetaValue::List(names));
            output.add_metadata("count", matches.len());
        }

        Ok(output)
    }
}
