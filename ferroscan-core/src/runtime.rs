//! Module runtime
//!
//! Executes the dispatched module list against one object. Each invocation
//! gets a merged option set and a cooperative deadline; failures and
//! timeouts become flags and `SCAN_FAILURES` metadata on the object, never
//! errors out of the scan. Children are admitted against the scan's resource
//! caps before they reach the queue.

use indexmap::IndexMap;
use smol_str::SmolStr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::dispatch::ModuleInvocation;
use crate::error::ModuleError;
use crate::module::{Deadline, ModuleContext, ModuleOptions, ModuleRegistry};
use crate::object::{ExternalVars, ScanObject};

/// Mutable scan-wide counters, owned by the driver
pub(crate) struct ScanBudget {
    /// Objects admitted so far, root included
    pub objects: usize,
    /// Bytes stored across admitted objects
    pub bytes: u64,
    /// Whole-scan deadline
    pub deadline: Deadline,
}

/// Result of running one object's module list
pub(crate) struct RunOutcome {
    /// Children admitted to the queue
    pub children: Vec<ScanObject>,
    /// The scan budget ran out; the driver must halt
    pub aborted: bool,
}

/// Run the dispatched module list against `object`
///
/// Modules execute strictly in dispatch order; metadata and flags committed
/// by one module are visible to every later module on the same object.
pub(crate) fn run_modules(
    object: &mut ScanObject,
    invocations: &[ModuleInvocation],
    registry: &ModuleRegistry,
    config: &ScanConfig,
    external: &ExternalVars,
    scan_overrides: &IndexMap<SmolStr, ModuleOptions>,
    budget: &mut ScanBudget,
) -> RunOutcome {
    let mut children = Vec::new();

    for invocation in invocations {
        if budget.deadline.expired() {
            warn!(object = %object.uuid, "scan time exhausted");
            object.add_flag("SCAN:ABORTED");
            return RunOutcome {
                children,
                aborted: true,
            };
        }

        let entry = match registry.get(&invocation.name) {
            Some(entry) => entry,
            None => {
                warn!(module = %invocation.name, "module not in registry");
                object.add_flag(format!("DISPATCH:MISSING_MODULE:{}", invocation.name));
                continue;
            }
        };
        if !entry.defaults.enabled {
            debug!(module = %invocation.name, "module disabled, skipping");
            continue;
        }

        // defaults < dispatch action < per-scan override
        let mut options = entry.defaults.options.clone();
        options.overlay(&invocation.options);
        if let Some(overrides) = scan_overrides.get(&invocation.name) {
            options.overlay(overrides);
        }

        let budget_ms = match module_budget_ms(&options, entry.defaults.timeout_ms, config) {
            Ok(ms) => ms,
            Err(error) => {
                warn!(module = %invocation.name, %error, "bad dispatch options");
                object.add_flag(format!("DISPATCH:BAD_OPTIONS:{}", invocation.name));
                continue;
            }
        };

        let ctx = ModuleContext {
            external,
            options,
            depth: object.depth,
            deadline: Deadline::after(Duration::from_millis(budget_ms)),
        };

        debug!(module = %invocation.name, object = %object.uuid, "running module");
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| entry.module.scan(&*object, &ctx)));
        let elapsed = started.elapsed();

        object.record_module_run(invocation.name.clone());

        let output = match result {
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(module = %invocation.name, %message, "module panicked");
                object.add_flag(format!("MODULE:ERROR:{}", invocation.name));
                object.record_failure(
                    &invocation.name,
                    &message,
                    &format!("panic in module '{}'", invocation.name),
                );
                continue;
            }
            Ok(Err(ModuleError::Timeout)) => {
                warn!(module = %invocation.name, "module hit its deadline");
                object.add_flag(format!("MODULE:TIMEOUT:{}", invocation.name));
                continue;
            }
            Ok(Err(ModuleError::InvalidOptions(message))) => {
                warn!(module = %invocation.name, %message, "module rejected its options");
                object.add_flag(format!("DISPATCH:BAD_OPTIONS:{}", invocation.name));
                continue;
            }
            Ok(Err(ModuleError::Failed(message))) => {
                warn!(module = %invocation.name, %message, "module failed");
                object.add_flag(format!("MODULE:ERROR:{}", invocation.name));
                object.record_failure(&invocation.name, &message, &invocation.name);
                continue;
            }
            Ok(Ok(output)) => output,
        };

        // A module that returned late does not get to commit anything
        if elapsed > Duration::from_millis(budget_ms) {
            warn!(module = %invocation.name, ?elapsed, "module exceeded its budget, output discarded");
            object.add_flag(format!("MODULE:TIMEOUT:{}", invocation.name));
            continue;
        }

        commit_output(object, &invocation.name, output, entry.defaults.max_children, config, external, budget, &mut children);
    }

    RunOutcome {
        children,
        aborted: false,
    }
}

/// Per-invocation time budget: framework default, overridden by the module
/// table, overridden by a `timeout` dispatch option (milliseconds)
fn module_budget_ms(
    options: &ModuleOptions,
    module_default: Option<u64>,
    config: &ScanConfig,
) -> Result<u64, ModuleError> {
    if let Some(from_options) = options.get_int("timeout")? {
        if from_options <= 0 {
            return Err(ModuleError::InvalidOptions(format!(
                "timeout must be positive, got {}",
                from_options
            )));
        }
        return Ok(from_options as u64);
    }
    Ok(module_default.unwrap_or(config.module_time_ms))
}

/// Commit a successful module output: flags, metadata, then children
fn commit_output(
    object: &mut ScanObject,
    module: &SmolStr,
    output: crate::module::ModuleOutput,
    module_max_children: Option<usize>,
    config: &ScanConfig,
    external: &ExternalVars,
    budget: &mut ScanBudget,
    children: &mut Vec<ScanObject>,
) {
    for flag in output.flags {
        object.add_flag(flag);
    }

    for (field, value) in output.metadata {
        let value = if value.is_json_representable() {
            value
        } else {
            object.add_flag(format!("METADATA:COERCED:{}", module));
            value.coerced()
        };
        object.add_metadata(module.clone(), field, value);
    }

    let max_children = module_max_children.unwrap_or(config.max_children);
    let mut accepted = 0usize;

    for child in output.children {
        if object.depth + 1 > config.max_depth {
            debug!(module = %module, "child beyond max depth dropped");
            object.add_flag("SCAN:MAX_DEPTH");
            continue;
        }
        if child.buffer.len() as u64 > config.max_child_size {
            warn!(module = %module, size = child.buffer.len(), "oversized child dropped");
            object.add_flag("SCAN:MAX_CHILD_SIZE");
            continue;
        }
        if accepted >= max_children {
            object.add_flag(format!("MODULE:CHILD_LIMIT:{}", module));
            break;
        }
        if budget.objects >= config.max_objects {
            object.add_flag("SCAN:MAX_OBJECTS");
            break;
        }
        if budget.bytes + child.buffer.len() as u64 > config.max_bytes {
            object.add_flag("SCAN:MAX_BYTES");
            break;
        }

        budget.objects += 1;
        budget.bytes += child.buffer.len() as u64;
        accepted += 1;

        children.push(ScanObject::child(
            child.buffer,
            object,
            module.clone(),
            child.filename,
            config.object_hash,
        ));
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleResult;
    use crate::module::{ChildSpec, ModuleDefaults, ModuleOutput, ScanModule};
    use crate::object::HashKind;
    use std::sync::Arc;

    struct Flagger;
    impl ScanModule for Flagger {
        fn name(&self) -> &'static str {
            "FLAGGER"
        }
        fn scan(&self, _: &ScanObject, _: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
            let mut output = ModuleOutput::new();
            output.add_flag("flagged");
            output.add_metadata("note", "present");
            Ok(output)
        }
    }

    struct Panicker;
    impl ScanModule for Panicker {
        fn name(&self) -> &'static str {
            "PANICKER"
        }
        fn scan(&self, _: &ScanObject, _: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
            panic!("boom at offset 0");
        }
    }

    struct Sleeper;
    impl ScanModule for Sleeper {
        fn name(&self) -> &'static str {
            "SLEEPER"
        }
        fn scan(&self, _: &ScanObject, _: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
            std::thread::sleep(Duration::from_millis(50));
            Ok(ModuleOutput::new())
        }
    }

    struct Splitter;
    impl ScanModule for Splitter {
        fn name(&self) -> &'static str {
            "SPLITTER"
        }
        fn scan(&self, object: &ScanObject, _: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
            let mut output = ModuleOutput::new();
            for chunk in object.buffer().chunks(2) {
                output.add_child(ChildSpec::new(chunk.to_vec()));
            }
            Ok(output)
        }
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Flagger));
        registry.register(Arc::new(Panicker));
        registry.register(Arc::new(Sleeper));
        registry.register(Arc::new(Splitter));
        registry
    }

    fn invocation(name: &str) -> ModuleInvocation {
        ModuleInvocation {
            name: SmolStr::new(name),
            options: ModuleOptions::new(),
        }
    }

    fn budget(config: &ScanConfig) -> ScanBudget {
        ScanBudget {
            objects: 1,
            bytes: 0,
            deadline: Deadline::after(Duration::from_millis(config.scan_time_ms)),
        }
    }

    fn root(buffer: &[u8]) -> ScanObject {
        ScanObject::root(buffer.to_vec(), &ExternalVars::default(), HashKind::Sha256)
    }

    #[test]
    fn test_successful_module_commits_output() {
        let config = ScanConfig::default();
        let mut object = root(b"data");
        let mut budget = budget(&config);

        let outcome = run_modules(
            &mut object,
            &[invocation("FLAGGER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(!outcome.aborted);
        assert!(object.has_flag("flagged"));
        assert!(object.metadata_get("FLAGGER", "note").is_some());
        assert_eq!(object.scan_modules, vec!["FLAGGER"]);
    }

    #[test]
    fn test_panic_becomes_error_flag_and_failure_record() {
        let config = ScanConfig::default();
        let mut object = root(b"data");
        let mut budget = budget(&config);

        run_modules(
            &mut object,
            &[invocation("PANICKER"), invocation("FLAGGER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(object.has_flag("MODULE:ERROR:PANICKER"));
        // The failure is recorded and the next module still runs
        assert!(object.metadata_get("SCAN_FAILURES", "failures").is_some());
        assert!(object.has_flag("flagged"));
    }

    #[test]
    fn test_slow_module_output_discarded() {
        let config = ScanConfig {
            module_time_ms: 10,
            ..ScanConfig::default()
        };
        let mut object = root(b"data");
        let mut budget = budget(&config);

        run_modules(
            &mut object,
            &[invocation("SLEEPER"), invocation("FLAGGER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(object.has_flag("MODULE:TIMEOUT:SLEEPER"));
        assert!(object.has_flag("flagged"));
    }

    #[test]
    fn test_missing_module_flagged_and_skipped() {
        let config = ScanConfig::default();
        let mut object = root(b"data");
        let mut budget = budget(&config);

        run_modules(
            &mut object,
            &[invocation("NO_SUCH_MODULE")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(object.has_flag("DISPATCH:MISSING_MODULE:NO_SUCH_MODULE"));
        assert!(object.scan_modules.is_empty());
    }

    #[test]
    fn test_disabled_module_skipped_silently() {
        let config = ScanConfig::default();
        let mut registry = ModuleRegistry::new();
        registry.register_with(
            Arc::new(Flagger),
            ModuleDefaults {
                enabled: false,
                ..ModuleDefaults::default()
            },
        );

        let mut object = root(b"data");
        let mut budget = budget(&config);
        run_modules(
            &mut object,
            &[invocation("FLAGGER")],
            &registry,
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(object.flags.is_empty());
        assert!(object.scan_modules.is_empty());
    }

    #[test]
    fn test_children_admitted_and_counted() {
        let config = ScanConfig::default();
        let mut object = root(b"abcdef");
        let mut budget = budget(&config);

        let outcome = run_modules(
            &mut object,
            &[invocation("SPLITTER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert_eq!(outcome.children.len(), 3);
        assert_eq!(budget.objects, 4);
        assert_eq!(budget.bytes, 6);
        for child in &outcome.children {
            assert_eq!(child.depth, 1);
            assert_eq!(child.source_module.as_deref(), Some("SPLITTER"));
            assert_eq!(child.root_uuid, object.root_uuid);
        }
    }

    #[test]
    fn test_depth_cap_drops_children() {
        let config = ScanConfig {
            max_depth: 0,
            ..ScanConfig::default()
        };
        let mut object = root(b"abcd");
        let mut budget = budget(&config);

        let outcome = run_modules(
            &mut object,
            &[invocation("SPLITTER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(outcome.children.is_empty());
        assert!(object.has_flag("SCAN:MAX_DEPTH"));
    }

    #[test]
    fn test_child_count_cap() {
        let config = ScanConfig {
            max_children: 2,
            ..ScanConfig::default()
        };
        let mut object = root(b"abcdefgh");
        let mut budget = budget(&config);

        let outcome = run_modules(
            &mut object,
            &[invocation("SPLITTER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert_eq!(outcome.children.len(), 2);
        assert!(object.has_flag("MODULE:CHILD_LIMIT:SPLITTER"));
    }

    #[test]
    fn test_object_cap_blocks_children() {
        let config = ScanConfig {
            max_objects: 2,
            ..ScanConfig::default()
        };
        let mut object = root(b"abcdef");
        let mut budget = budget(&config);

        let outcome = run_modules(
            &mut object,
            &[invocation("SPLITTER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert_eq!(outcome.children.len(), 1);
        assert!(object.has_flag("SCAN:MAX_OBJECTS"));
    }

    #[test]
    fn test_byte_cap_blocks_children() {
        let config = ScanConfig {
            max_bytes: 4,
            ..ScanConfig::default()
        };
        let mut object = root(b"abcdef");
        let mut budget = budget(&config);
        budget.bytes = 3;

        let outcome = run_modules(
            &mut object,
            &[invocation("SPLITTER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(outcome.children.is_empty());
        assert!(object.has_flag("SCAN:MAX_BYTES"));
    }

    #[test]
    fn test_exhausted_scan_deadline_aborts() {
        let config = ScanConfig::default();
        let mut object = root(b"data");
        let mut budget = ScanBudget {
            objects: 1,
            bytes: 0,
            deadline: Deadline::after(Duration::from_millis(0)),
        };

        let outcome = run_modules(
            &mut object,
            &[invocation("FLAGGER")],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(outcome.aborted);
        assert!(object.has_flag("SCAN:ABORTED"));
        assert!(!object.has_flag("flagged"));
    }

    #[test]
    fn test_bad_timeout_option_flags_and_skips() {
        let config = ScanConfig::default();
        let mut object = root(b"data");
        let mut budget = budget(&config);

        let invocation = ModuleInvocation {
            name: SmolStr::new("FLAGGER"),
            options: ModuleOptions::new().with("timeout", "soon"),
        };

        run_modules(
            &mut object,
            &[invocation],
            &registry(),
            &config,
            &ExternalVars::default(),
            &IndexMap::new(),
            &mut budget,
        );

        assert!(object.has_flag("DISPATCH:BAD_OPTIONS:FLAGGER"));
        assert!(!object.has_flag("flagged"));
    }
}
