//! Dispatcher
//!
//! Decides which modules run against an object. Dispatch rules are compiled
//! once per engine; each action carries an ordered module list, flags and
//! content types, and comes either from the rule's `meta` section or from a
//! separate action-table text file in the canonical form
//!
//! ```text
//! rule_name : module,module(opt=val),module ; flag1,flag2 ; ctype ; priority
//! ```
//!
//! Matched actions apply in config-declared order (priority weight first,
//! declaration order as the tie-break), never in the matcher's emit order.

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::{debug, warn};

use ferroscan_rules::{CompiledRules, RuleInputs};

use crate::error::{EngineError, EngineResult};
use crate::module::{ModuleOptions, ModuleRegistry};
use crate::object::{ExternalVars, ScanObject};

/// Action priority used when an entry declares none
const DEFAULT_PRIORITY: i64 = 9;

/// Meta keys recognized as embedded dispatch actions
const META_MODULES: &str = "scan_modules";
const META_FLAGS: &str = "flags";
const META_CONTENT_TYPE: &str = "content_type";
const META_PRIORITY: &str = "priority";

/// One module reference inside an action, with its option overrides
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInvocation {
    /// Module name, resolved through the registry at run time
    pub name: SmolStr,
    /// Dispatch-layer option overrides
    pub options: ModuleOptions,
}

/// The action taken when a dispatch rule matches
#[derive(Debug, Clone, Default)]
pub struct DispatchAction {
    /// Ordered module list
    pub modules: Vec<ModuleInvocation>,
    /// Flags added unconditionally to the object
    pub flags: Vec<SmolStr>,
    /// Content types added to the object
    pub content_types: Vec<SmolStr>,
    /// Ordering weight; lower runs earlier
    pub priority: i64,
}

/// Compiled dispatch rules plus their ordered action table
pub struct DispatchTable {
    rules: CompiledRules,
    /// Actions keyed by rule name (or `default`), in config-declared order
    actions: IndexMap<SmolStr, DispatchAction>,
}

impl DispatchTable {
    /// Compile dispatch rules, reading actions from each rule's meta section
    pub fn compile(rules_source: &str) -> EngineResult<Self> {
        let rules = ferroscan_rules::compile(rules_source)?;

        let mut actions = IndexMap::new();
        for rule in rules.rules() {
            if let Some(action) = action_from_meta(rule)? {
                actions.insert(rule.name.clone(), action);
            }
        }

        Ok(Self { rules, actions })
    }

    /// Merge entries from an action-table text file
    ///
    /// A table entry overrides a same-named meta action; entries for rules
    /// the compiled source does not define are a configuration error, except
    /// the `default` entry, which supplies the no-match action.
    pub fn with_action_table(mut self, table: &str) -> EngineResult<Self> {
        for (line_no, line) in table.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (name, action) = parse_action_line(line).map_err(|e| {
                EngineError::DispatchConfig(format!("action table line {}: {}", line_no + 1, e))
            })?;

            if name != "default" && !self.rules.rules().any(|r| r.name == name) {
                return Err(EngineError::DispatchConfig(format!(
                    "action table references unknown rule '{}'",
                    name
                )));
            }

            self.actions.insert(name, action);
        }

        Ok(self)
    }

    /// Verify that every referenced module exists in the registry
    pub fn validate(&self, registry: &ModuleRegistry) -> EngineResult<()> {
        for (rule, action) in &self.actions {
            for invocation in &action.modules {
                if !registry.contains(&invocation.name) {
                    return Err(EngineError::DispatchConfig(format!(
                        "rule '{}' references unknown module '{}'",
                        rule, invocation.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of declared actions
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Select the ordered module list for an object
    ///
    /// Records matched rule names as the object's type, applies action flags
    /// and content types, and strips modules that already ran (unless the
    /// envelope permits a rescan). Duplicate module references keep the
    /// first occurrence; an ignored duplicate with different options raises
    /// `DISPATCH:DUPLICATE_MODULE`.
    pub fn dispatch(
        &self,
        object: &mut ScanObject,
        external: &ExternalVars,
    ) -> Vec<ModuleInvocation> {
        let inputs = rule_inputs(object, external);
        let mut matched = self.rules.matched_names(object.buffer(), &inputs);
        if matched.is_empty() {
            matched.push(SmolStr::new("default"));
        }

        for name in &matched {
            object.add_object_type(name.clone());
        }

        // Config-declared order, refined by priority weight
        let mut selected: Vec<(&SmolStr, &DispatchAction)> = self
            .actions
            .iter()
            .filter(|(name, _)| matched.iter().any(|m| m == *name))
            .collect();
        selected.sort_by_key(|(_, action)| action.priority);

        let mut invocations: Vec<ModuleInvocation> = Vec::new();
        for (rule_name, action) in selected {
            debug!(rule = %rule_name, modules = action.modules.len(), "dispatch action");

            for flag in &action.flags {
                object.add_flag(flag.clone());
            }
            for content_type in &action.content_types {
                object.add_content_type(content_type.clone());
            }

            for invocation in &action.modules {
                match invocations.iter().find(|i| i.name == invocation.name) {
                    None => invocations.push(invocation.clone()),
                    Some(first) => {
                        if first.options != invocation.options {
                            warn!(module = %invocation.name, "duplicate module with conflicting options");
                            object.add_flag("DISPATCH:DUPLICATE_MODULE");
                        }
                    }
                }
            }
        }

        invocations
            .into_iter()
            .filter(|invocation| {
                !object.has_run(&invocation.name) || external.may_rescan(&invocation.name)
            })
            .collect()
    }
}

/// Rule-time inputs for an object: the submission envelope plus the fields
/// the object itself contributes
pub(crate) fn rule_inputs(object: &ScanObject, external: &ExternalVars) -> RuleInputs {
    let mut inputs = RuleInputs::new();
    inputs.set_str("source", external.source.clone());
    inputs.set_str("ephID", external.eph_id.clone());
    inputs.set_str("submitID", external.submit_id.clone());
    inputs.set_str("extSourceTags", external.ext_source_tags.join(","));
    inputs.set_str(
        "filename",
        object
            .filename
            .clone()
            .or_else(|| external.filename.clone())
            .unwrap_or_default(),
    );
    inputs.set_str(
        "contentType",
        external.content_type.clone().unwrap_or_default(),
    );
    inputs.set_int("depth", object.depth as i64);
    inputs
}

/// Build an action from a rule's meta section, if it declares one
fn action_from_meta(rule: &ferroscan_rules::CompiledRule) -> EngineResult<Option<DispatchAction>> {
    let modules_meta = rule.meta_get(META_MODULES);
    let flags_meta = rule.meta_get(META_FLAGS);
    let ctype_meta = rule.meta_get(META_CONTENT_TYPE);

    if modules_meta.is_none() && flags_meta.is_none() && ctype_meta.is_none() {
        return Ok(None);
    }

    let modules = match modules_meta {
        Some(value) => {
            let text = value.as_str().ok_or_else(|| {
                EngineError::DispatchConfig(format!(
                    "rule '{}': {} must be a string",
                    rule.name, META_MODULES
                ))
            })?;
            parse_module_list(text)
                .map_err(|e| EngineError::DispatchConfig(format!("rule '{}': {}", rule.name, e)))?
        }
        None => Vec::new(),
    };

    Ok(Some(DispatchAction {
        modules,
        flags: split_names(flags_meta.and_then(|v| v.as_str())),
        content_types: split_names(ctype_meta.and_then(|v| v.as_str())),
        priority: rule
            .meta_get(META_PRIORITY)
            .and_then(|v| v.as_int())
            .unwrap_or(DEFAULT_PRIORITY),
    }))
}

fn split_names(value: Option<&str>) -> Vec<SmolStr> {
    value
        .map(|text| {
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SmolStr::new)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one canonical action-table line
fn parse_action_line(line: &str) -> Result<(SmolStr, DispatchAction), String> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| "missing ':' after rule name".to_string())?;
    let name = SmolStr::new(name.trim());
    if name.is_empty() {
        return Err("empty rule name".to_string());
    }

    let mut sections = rest.split(';').map(str::trim);
    let modules = parse_module_list(sections.next().unwrap_or(""))?;
    let flags = split_names(sections.next());
    let content_types = split_names(sections.next());
    let priority = match sections.next() {
        None | Some("") => DEFAULT_PRIORITY,
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| format!("invalid priority '{}'", raw))?,
    };

    Ok((
        name,
        DispatchAction {
            modules,
            flags,
            content_types,
            priority,
        },
    ))
}

/// Parse a module list: `NAME,NAME(key=value,key=value),NAME`
fn parse_module_list(text: &str) -> Result<Vec<ModuleInvocation>, String> {
    let mut invocations = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let (item, remainder) = split_module_item(rest)?;
        rest = remainder.trim_start_matches(',').trim();

        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        match item.split_once('(') {
            None => invocations.push(ModuleInvocation {
                name: SmolStr::new(item),
                options: ModuleOptions::new(),
            }),
            Some((name, args)) => {
                let args = args
                    .strip_suffix(')')
                    .ok_or_else(|| format!("unterminated options in '{}'", item))?;
                let mut options = ModuleOptions::new();
                for pair in args.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (key, value) = pair
                        .split_once('=')
                        .ok_or_else(|| format!("invalid option '{}' in '{}'", pair, item))?;
                    options.set(key.trim(), value.trim());
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(format!("missing module name in '{}'", item));
                }
                invocations.push(ModuleInvocation {
                    name: SmolStr::new(name),
                    options,
                });
            }
        }
    }

    Ok(invocations)
}

/// Split off the first module item, keeping commas inside parentheses
fn split_module_item(text: &str) -> Result<(&str, &str), String> {
    let mut in_parens = false;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' if in_parens => return Err(format!("nested '(' in '{}'", text)),
            '(' => in_parens = true,
            ')' => in_parens = false,
            ',' if !in_parens => return Ok((&text[..idx], &text[idx + 1..])),
            _ => {}
        }
    }
    if in_parens {
        return Err(format!("unterminated options in '{}'", text));
    }
    Ok((text, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HashKind;

    const DISPATCH_RULES: &str = r#"
        rule zip_archive {
            meta:
                scan_modules = "EXPLODE_ZIP(password=infected),META_HASH"
                flags = "archive"
                content_type = "application/zip"
            strings:
                $pk = { 50 4B 03 04 }
            condition:
                $pk at 0
        }

        rule mz_executable {
            meta:
                scan_modules = "META_HASH,SCAN_YARA"
                flags = "executable"
            condition:
                uint16(0) == 0x5A4D
        }
    "#;

    fn root(buffer: &[u8]) -> ScanObject {
        ScanObject::root(buffer.to_vec(), &ExternalVars::default(), HashKind::Sha256)
    }

    #[test]
    fn test_compile_reads_meta_actions() {
        let table = DispatchTable::compile(DISPATCH_RULES).unwrap();
        assert_eq!(table.action_count(), 2);
    }

    #[test]
    fn test_dispatch_selects_matching_action() {
        let table = DispatchTable::compile(DISPATCH_RULES).unwrap();
        let mut object = root(b"PK\x03\x04archive-bytes");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());

        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].name.as_str(), "EXPLODE_ZIP");
        assert_eq!(invocations[0].options.get("password"), Some("infected"));
        assert_eq!(invocations[1].name.as_str(), "META_HASH");

        assert_eq!(object.object_type, vec!["zip_archive"]);
        assert!(object.has_flag("archive"));
        assert_eq!(object.content_type, vec!["application/zip"]);
    }

    #[test]
    fn test_dispatch_falls_back_to_default() {
        let table = DispatchTable::compile(DISPATCH_RULES)
            .unwrap()
            .with_action_table("default : META_HASH ; unrecognized")
            .unwrap();
        let mut object = root(b"plain text");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());

        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].name.as_str(), "META_HASH");
        assert_eq!(object.object_type, vec!["default"]);
        assert!(object.has_flag("unrecognized"));
    }

    #[test]
    fn test_dispatch_no_default_yields_empty_list() {
        let table = DispatchTable::compile(DISPATCH_RULES).unwrap();
        let mut object = root(b"plain text");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());
        assert!(invocations.is_empty());
    }

    #[test]
    fn test_dispatch_duplicate_module_first_wins() {
        // Both rules match an MZ header inside a ZIP; META_HASH appears twice
        let table = DispatchTable::compile(
            r#"
            rule a {
                meta:
                    scan_modules = "META_HASH(algo=md5)"
                condition:
                    uint16(0) == 0x5A4D
            }
            rule b {
                meta:
                    scan_modules = "META_HASH(algo=sha256)"
                condition:
                    filesize > 0
            }
            "#,
        )
        .unwrap();

        let mut object = root(b"MZ\x90\x00");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());

        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].options.get("algo"), Some("md5"));
        assert!(object.has_flag("DISPATCH:DUPLICATE_MODULE"));
    }

    #[test]
    fn test_dispatch_identical_duplicate_is_silent() {
        let table = DispatchTable::compile(
            r#"
            rule a {
                meta: scan_modules = "META_HASH"
                condition: uint16(0) == 0x5A4D
            }
            rule b {
                meta: scan_modules = "META_HASH"
                condition: filesize > 0
            }
            "#,
        )
        .unwrap();

        let mut object = root(b"MZ\x90\x00");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());

        assert_eq!(invocations.len(), 1);
        assert!(!object.has_flag("DISPATCH:DUPLICATE_MODULE"));
    }

    #[test]
    fn test_dispatch_strips_already_run_modules() {
        let table = DispatchTable::compile(DISPATCH_RULES).unwrap();
        let mut object = root(b"PK\x03\x04data");
        object.record_module_run("META_HASH");

        let invocations = table.dispatch(&mut object, &ExternalVars::default());
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].name.as_str(), "EXPLODE_ZIP");
    }

    #[test]
    fn test_dispatch_rescan_allows_rerun() {
        let table = DispatchTable::compile(DISPATCH_RULES).unwrap();
        let external = ExternalVars::default().with_rescan("META_HASH");
        let mut object = root(b"PK\x03\x04data");
        object.record_module_run("META_HASH");

        let invocations = table.dispatch(&mut object, &external);
        assert_eq!(invocations.len(), 2);
    }

    #[test]
    fn test_priority_reorders_actions() {
        let table = DispatchTable::compile(
            r#"
            rule later {
                meta:
                    scan_modules = "SECOND"
                condition: true
            }
            rule earlier {
                meta:
                    scan_modules = "FIRST"
                    priority = 1
                condition: true
            }
            "#,
        )
        .unwrap();

        let mut object = root(b"anything");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());
        assert_eq!(invocations[0].name.as_str(), "FIRST");
        assert_eq!(invocations[1].name.as_str(), "SECOND");
    }

    #[test]
    fn test_action_table_overrides_meta() {
        let table = DispatchTable::compile(DISPATCH_RULES)
            .unwrap()
            .with_action_table("zip_archive : EXPLODE_ZIP(limit=10) ; ; ; 2")
            .unwrap();

        let mut object = root(b"PK\x03\x04data");
        let invocations = table.dispatch(&mut object, &ExternalVars::default());
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].options.get("limit"), Some("10"));
    }

    #[test]
    fn test_action_table_unknown_rule_is_fatal() {
        let result = DispatchTable::compile(DISPATCH_RULES)
            .unwrap()
            .with_action_table("no_such_rule : META_HASH");
        assert!(matches!(result, Err(EngineError::DispatchConfig(_))));
    }

    #[test]
    fn test_validate_against_registry() {
        use crate::module::{ModuleContext, ModuleOutput, ScanModule};
        use std::sync::Arc;

        struct Named(&'static str);
        impl ScanModule for Named {
            fn name(&self) -> &'static str {
                self.0
            }
            fn scan(
                &self,
                _: &ScanObject,
                _: &ModuleContext<'_>,
            ) -> crate::error::ModuleResult<ModuleOutput> {
                Ok(ModuleOutput::new())
            }
        }

        let table = DispatchTable::compile(DISPATCH_RULES).unwrap();

        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Named("EXPLODE_ZIP")));
        registry.register(Arc::new(Named("META_HASH")));
        assert!(table.validate(&registry).is_err());

        registry.register(Arc::new(Named("SCAN_YARA")));
        assert!(table.validate(&registry).is_ok());
    }

    #[test]
    fn test_parse_module_list_options() {
        let invocations =
            parse_module_list("A,B(x=1,y=two),C").unwrap();
        assert_eq!(invocations.len(), 3);
        assert_eq!(invocations[1].options.get("y"), Some("two"));
        assert!(invocations[2].options.is_empty());
    }

    #[test]
    fn test_parse_module_list_unterminated() {
        assert!(parse_module_list("A(b=1").is_err());
    }

    #[test]
    fn test_external_variables_reach_rules() {
        let table = DispatchTable::compile(
            r#"
            rule from_mail {
                meta:
                    scan_modules = "META_HASH"
                condition:
                    source == "mail"
            }
            "#,
        )
        .unwrap();

        let mut object = root(b"body");
        let external = ExternalVars::new("mail");
        let invocations = table.dispatch(&mut object, &external);
        assert_eq!(invocations.len(), 1);

        let mut object = root(b"body");
        let external = ExternalVars::new("s3");
        let invocations = table.dispatch(&mut object, &external);
        assert!(invocations.is_empty());
    }
}
