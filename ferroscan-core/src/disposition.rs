//! Dispositioner
//!
//! Folds the flags of a finished scan tree into a final verdict. Disposition
//! rules are ordinary rules matched against a synthetic buffer holding every
//! flag present anywhere in the tree, one per line, so flag presence is a
//! string match and AND/OR/NOT come from rule conditions. Each rule's
//! `meta.disposition` / `meta.reason` name the verdict it selects; the first
//! matching rule in declaration order wins.
//!
//! Configured flag weights are folded into an external integer variable
//! `priority` (the maximum weight among present flags), so rules can demand
//! `priority > 50` alongside literal flag matches.

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::{debug, warn};

use ferroscan_rules::{CompiledRules, RuleInputs};

use crate::error::EngineResult;
use crate::metadata::MetaValue;
use crate::object::ScanObject;

/// Metadata namespace the verdict is written to
pub const DISPOSITIONER: &str = "DISPOSITIONER";

/// The chosen verdict
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    /// Verdict value (Accept, Quarantine, Reject, ...)
    pub result: String,
    /// Human-readable reason
    pub reason: String,
    /// Name of the matching rule, empty for the default
    pub rule: String,
}

/// Compiled disposition policy
pub struct Dispositioner {
    rules: CompiledRules,
    weights: IndexMap<SmolStr, i64>,
    default_disposition: String,
}

impl Dispositioner {
    /// Compile a disposition rule source
    pub fn compile(
        source: &str,
        weights: IndexMap<SmolStr, i64>,
        default_disposition: impl Into<String>,
    ) -> EngineResult<Self> {
        Ok(Self {
            rules: ferroscan_rules::compile(source)?,
            weights,
            default_disposition: default_disposition.into(),
        })
    }

    /// A policy with no rules; every scan gets the default disposition
    pub fn default_only(default_disposition: impl Into<String>) -> EngineResult<Self> {
        Self::compile("", IndexMap::new(), default_disposition)
    }

    /// Run the policy over a finished tree and write the verdict to the root
    ///
    /// Observes the union of flags across every object, excluding the
    /// verdict flags a previous run may have written, so a second run over
    /// the same tree yields the same result.
    pub fn run(&self, objects: &mut [ScanObject]) -> Disposition {
        let flags = tree_flags(objects);
        let verdict = self.decide(&flags);

        if let Some(root) = objects.first_mut() {
            let mut entry = IndexMap::new();
            entry.insert(SmolStr::new("Result"), MetaValue::from(verdict.result.clone()));
            entry.insert(SmolStr::new("Reason"), MetaValue::from(verdict.reason.clone()));
            entry.insert(SmolStr::new("Rule"), MetaValue::from(verdict.rule.clone()));
            root.add_metadata(DISPOSITIONER, "Disposition", MetaValue::Map(entry));
            if Self::is_error_verdict(&verdict) {
                root.add_flag("DISPOSITIONER:ERROR");
            }
            root.add_flag(format!("DISPOSITION:{}", verdict.result));
        }

        verdict
    }

    /// Evaluate the rule table over a flag set
    fn decide(&self, flags: &[SmolStr]) -> Disposition {
        let buffer = flags
            .iter()
            .map(SmolStr::as_str)
            .collect::<Vec<_>>()
            .join("\n");

        let mut inputs = RuleInputs::new();
        inputs.set_int("priority", self.max_weight(flags));
        inputs.set_int("flag_count", flags.len() as i64);

        let matches = self.rules.scan(buffer.as_bytes(), &inputs);
        for matched in matches {
            match matched.meta.iter().find(|(k, _)| k == "disposition") {
                Some((_, ferroscan_rules::MetaValue::String(result))) => {
                    let reason = matched
                        .meta
                        .iter()
                        .find(|(k, _)| k == "reason")
                        .and_then(|(_, v)| v.as_str())
                        .unwrap_or(matched.name.as_str())
                        .to_string();

                    debug!(rule = %matched.name, result = %result, "disposition matched");
                    return Disposition {
                        result: result.to_string(),
                        reason,
                        rule: matched.name.to_string(),
                    };
                }
                _ => {
                    // A matching rule without a disposition is a policy bug;
                    // fail safe to the default verdict.
                    warn!(rule = %matched.name, "disposition rule missing meta.disposition");
                    return Disposition {
                        result: self.default_disposition.clone(),
                        reason: format!("rule '{}' has no disposition", matched.name),
                        rule: "DISPOSITIONER:ERROR".to_string(),
                    };
                }
            }
        }

        Disposition {
            result: self.default_disposition.clone(),
            reason: "no disposition rule matched".to_string(),
            rule: String::new(),
        }
    }

    fn max_weight(&self, flags: &[SmolStr]) -> i64 {
        flags
            .iter()
            .filter_map(|flag| self.weights.get(flag))
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Whether `decide` fell back because of a policy bug
    pub fn is_error_verdict(verdict: &Disposition) -> bool {
        verdict.rule == "DISPOSITIONER:ERROR"
    }
}

/// Union of flags across the tree, in tree order, minus verdict flags
fn tree_flags(objects: &[ScanObject]) -> Vec<SmolStr> {
    let mut flags: Vec<SmolStr> = Vec::new();
    for object in objects {
        for flag in &object.flags {
            if flag.starts_with("DISPOSITION:") {
                continue;
            }
            if !flags.contains(flag) {
                flags.push(flag.clone());
            }
        }
    }
    flags
}
