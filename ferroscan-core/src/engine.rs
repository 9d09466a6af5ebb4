//! Scan engine
//!
//! The top-level driver: seeds the work queue with the root object, runs
//! dispatch and the module runtime until the queue drains or a scan-level
//! cap trips, invokes the dispositioner over the finished tree, and shapes
//! the report. An engine is built once from configuration and compiled rule
//! tables and is immutable during scans; callers may share one engine across
//! worker threads, one scan per call.

use chrono::Utc;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{QueueOrder, ScanConfig, Verbosity};
use crate::dispatch::DispatchTable;
use crate::disposition::Dispositioner;
use crate::error::{EngineError, EngineResult};
use crate::module::{Deadline, ModuleOptions, ModuleRegistry};
use crate::object::{ExternalVars, ScanObject};
use crate::result::ScanReport;
use crate::runtime::{self, ScanBudget};

/// The scanning engine
pub struct ScanEngine {
    config: ScanConfig,
    registry: ModuleRegistry,
    dispatch: DispatchTable,
    dispositioner: Dispositioner,
}

impl ScanEngine {
    /// Build an engine from configuration and rule sources
    ///
    /// Compiles both rule tables and validates every dispatch action against
    /// the registry; configuration faults surface here, never mid-scan.
    pub fn new(
        config: ScanConfig,
        registry: ModuleRegistry,
        dispatch_rules: &str,
        disposition_rules: &str,
    ) -> EngineResult<Self> {
        config.validate()?;

        let dispatch = DispatchTable::compile(dispatch_rules)?;
        dispatch.validate(&registry)?;

        let weights = config
            .flag_weights
            .iter()
            .map(|(flag, weight)| (SmolStr::new(flag), *weight))
            .collect();
        let dispositioner =
            Dispositioner::compile(disposition_rules, weights, config.default_disposition.clone())?;

        Ok(Self {
            config,
            registry,
            dispatch,
            dispositioner,
        })
    }

    /// Build an engine, loading rule sources from the configured paths
    pub fn from_config(config: ScanConfig, registry: ModuleRegistry) -> EngineResult<Self> {
        let dispatch_rules = match &config.dispatch_rules_path {
            Some(path) => std::fs::read_to_string(path)?,
            None => String::new(),
        };
        let disposition_rules = match &config.disposition_rules_path {
            Some(path) => std::fs::read_to_string(path)?,
            None => String::new(),
        };
        Self::new(config, registry, &dispatch_rules, &disposition_rules)
    }

    /// Merge an action-table text file into the dispatch table
    pub fn with_action_table(mut self, table: &str) -> EngineResult<Self> {
        self.dispatch = self.dispatch.with_action_table(table)?;
        self.dispatch.validate(&self.registry)?;
        Ok(self)
    }

    /// The engine's configuration
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scan a buffer at the configured verbosity
    pub fn scan(&self, data: Vec<u8>, external: ExternalVars) -> EngineResult<ScanReport> {
        self.scan_with(data, external, self.config.result_level, &IndexMap::new())
    }

    /// Scan a buffer with explicit verbosity and per-scan option overrides
    ///
    /// Always produces a report; module faults are folded into the object
    /// tree as flags and metadata. The only error path is the framework
    /// itself failing to construct the scan.
    pub fn scan_with(
        &self,
        data: Vec<u8>,
        mut external: ExternalVars,
        level: Verbosity,
        scan_overrides: &IndexMap<SmolStr, ModuleOptions>,
    ) -> EngineResult<ScanReport> {
        let start_time = Utc::now();

        // The configured rescan list joins the submission's own
        for module in &self.config.rescan_modules {
            if !external.may_rescan(module) {
                external.rescan.push(SmolStr::new(module));
            }
        }

        let root = ScanObject::root(data, &external, self.config.object_hash);
        let root_size = root.object_size;
        info!(root = %root.uuid, size = root_size, source = %external.source, "scan started");

        let mut arena: Vec<ScanObject> = vec![root];
        let mut queue: VecDeque<usize> = VecDeque::new();
        queue.push_back(0);

        let mut budget = ScanBudget {
            objects: 1,
            bytes: root_size,
            deadline: Deadline::after(Duration::from_millis(self.config.scan_time_ms)),
        };

        while let Some(index) = queue.pop_front() {
            if budget.deadline.expired() {
                arena[index].add_flag("SCAN:ABORTED");
                debug!(remaining = queue.len(), "scan time exhausted, draining queue");
                break;
            }

            let invocations = self.dispatch.dispatch(&mut arena[index], &external);
            let outcome = runtime::run_modules(
                &mut arena[index],
                &invocations,
                &self.registry,
                &self.config,
                &external,
                scan_overrides,
                &mut budget,
            );

            // Children dispatch only after every module on the parent ran
            let first_child = arena.len();
            let child_count = outcome.children.len();
            arena.extend(outcome.children);
            match self.config.queue_order {
                QueueOrder::Bfs => {
                    for child in first_child..first_child + child_count {
                        queue.push_back(child);
                    }
                }
                QueueOrder::Dfs => {
                    for child in (first_child..first_child + child_count).rev() {
                        queue.push_front(child);
                    }
                }
            }

            if outcome.aborted {
                break;
            }
        }

        // Scan-level cap flags are root-visible regardless of where they hit
        let cap_flags: Vec<SmolStr> = arena
            .iter()
            .flat_map(|object| object.flags.iter())
            .filter(|flag| flag.starts_with("SCAN:"))
            .cloned()
            .collect();
        for flag in cap_flags {
            arena[0].add_flag(flag);
        }

        let verdict = self.dispositioner.run(&mut arena);
        info!(
            root = %arena[0].uuid,
            objects = arena.len(),
            disposition = %verdict.result,
            "scan finished"
        );

        Ok(ScanReport::build(&arena, external.source, start_time, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleResult;
    use crate::module::{ChildSpec, ModuleContext, ModuleOutput, ScanModule};
    use std::sync::Arc;

    struct Echo;
    impl ScanModule for Echo {
        fn name(&self) -> &'static str {
            "ECHO"
        }
        fn scan(&self, object: &ScanObject, _: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
            let mut output = ModuleOutput::new();
            output.add_metadata("size", object.object_size);
            Ok(output)
        }
    }

    struct Halver;
    impl ScanModule for Halver {
        fn name(&self) -> &'static str {
            "HALVER"
        }
        fn scan(&self, object: &ScanObject, _: &ModuleContext<'_>) -> ModuleResult<ModuleOutput> {
            let mut output = ModuleOutput::new();
            let buffer = object.buffer();
            if buffer.len() >= 2 {
                let mid = buffer.len() / 2;
                output.add_child(ChildSpec::new(buffer[..mid].to_vec()));
                output.add_child(ChildSpec::new(buffer[mid..].to_vec()));
            }
            Ok(output)
        }
    }

    fn engine(dispatch: &str, config: ScanConfig) -> ScanEngine {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Halver));
        ScanEngine::new(config, registry, dispatch, "").unwrap()
    }

    const SPLIT_ALL: &str = r#"
        rule everything {
            meta:
                scan_modules = "HALVER,ECHO"
            condition:
                filesize > 1
        }
    "#;

    #[test]
    fn test_scan_builds_tree() {
        let config = ScanConfig {
            max_depth: 2,
            ..ScanConfig::default()
        };
        let report = engine(SPLIT_ALL, config)
            .scan(b"abcdefgh".to_vec(), ExternalVars::new("test"))
            .unwrap();

        // 1 root + 2 halves + 4 quarters
        assert_eq!(report.files.len(), 7);
        let root = report.root().unwrap();
        assert_eq!(root.scan_modules, vec!["HALVER", "ECHO"]);
    }

    #[test]
    fn test_bfs_order_scans_siblings_before_grandchildren() {
        let config = ScanConfig {
            max_depth: 2,
            ..ScanConfig::default()
        };
        let report = engine(SPLIT_ALL, config)
            .scan(b"abcdefgh".to_vec(), ExternalVars::new("test"))
            .unwrap();

        let depths: Vec<usize> = report.files.values().map(|f| f.depth).collect();
        // Arena order is admission order: bfs admits whole levels in turn
        assert_eq!(depths, vec![0, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_dfs_order_follows_chains() {
        let config = ScanConfig {
            max_depth: 2,
            queue_order: QueueOrder::Dfs,
            ..ScanConfig::default()
        };
        let report = engine(SPLIT_ALL, config)
            .scan(b"abcdefgh".to_vec(), ExternalVars::new("test"))
            .unwrap();

        assert_eq!(report.files.len(), 7);
        // First half explodes before the second half is touched
        let records: Vec<_> = report.files.values().collect();
        assert_eq!(records[1].depth, 1);
        assert_eq!(records[3].depth, 2);
    }

    #[test]
    fn test_unknown_dispatch_module_is_startup_error() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Echo));
        let result = ScanEngine::new(
            ScanConfig::default(),
            registry,
            r#"rule r { meta: scan_modules = "MISSING" condition: true }"#,
            "",
        );
        assert!(matches!(result, Err(EngineError::DispatchConfig(_))));
    }

    #[test]
    fn test_invalid_disposition_rules_are_startup_error() {
        let registry = ModuleRegistry::new();
        let result = ScanEngine::new(ScanConfig::default(), registry, "", "rule broken {");
        assert!(matches!(result, Err(EngineError::Rule(_))));
    }

    #[test]
    fn test_scan_without_rules_still_reports() {
        let report = engine("", ScanConfig::default())
            .scan(b"anything".to_vec(), ExternalVars::new("test"))
            .unwrap();

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.disposition(), Some("Accept"));
        let root = report.root().unwrap();
        assert_eq!(root.object_type, vec!["default"]);
    }
}
