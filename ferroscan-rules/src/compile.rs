//! Rule compilation
//!
//! Validates parsed rules and lowers their string patterns into the two
//! matching backends: a double-array Aho-Corasick automaton for plain
//! literals and compiled byte regexes for everything else (nocase,
//! fullword, wildcard hex, regex).

use daachorse::DoubleArrayAhoCorasick;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::collections::HashSet;
use std::fmt::Write as _;

use crate::ast::{Expr, HexToken, MetaValue, Rule, StringPattern};
use crate::error::{RuleError, RuleResult};
use crate::parser::parse;

/// Upper bound on the total number of string patterns in one compiled set
const MAX_PATTERNS: usize = 10_000;

/// Pattern identifier, an index into the compiled pattern table
pub type PatternId = usize;

/// A compiled rule
#[derive(Debug)]
pub struct CompiledRule {
    /// Rule name
    pub name: SmolStr,
    /// Rule tags
    pub tags: Vec<SmolStr>,
    /// Metadata entries in declaration order
    pub meta: Vec<(SmolStr, MetaValue)>,
    /// Condition expression
    pub(crate) condition: Expr,
    /// Patterns declared by this rule
    pub(crate) patterns: Vec<PatternId>,
}

impl CompiledRule {
    /// Look up a meta value by key
    pub fn meta_get(&self, key: &str) -> Option<&MetaValue> {
        self.meta.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// A compiled string pattern
#[derive(Debug)]
pub(crate) struct CompiledPattern {
    /// Identifier without the `$` sigil
    pub identifier: SmolStr,
}

/// A set of compiled rules, ready to scan
pub struct CompiledRules {
    pub(crate) rules: Vec<CompiledRule>,
    pub(crate) patterns: Vec<CompiledPattern>,
    /// Automaton over unique literal byte strings; None when no literals
    pub(crate) literals: Option<DoubleArrayAhoCorasick<usize>>,
    /// Pattern ids per unique literal, indexed by automaton value
    pub(crate) literal_groups: Vec<Vec<PatternId>>,
    /// Regex-backed patterns
    pub(crate) regexes: Vec<(PatternId, regex::bytes::Regex)>,
}

impl std::fmt::Debug for CompiledRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRules")
            .field("rules", &self.rules)
            .field("patterns", &self.patterns)
            .field("literal_groups", &self.literal_groups)
            .field("regexes", &self.regexes)
            .finish()
    }
}

impl CompiledRules {
    /// Number of compiled rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compiled rules in declaration order
    pub fn rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter()
    }

    /// Number of compiled string patterns
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Compile rule source into a [`CompiledRules`] set
pub fn compile(source: &str) -> RuleResult<CompiledRules> {
    let file = parse(source)?;

    let mut seen = HashSet::new();
    for rule in &file.rules {
        if !seen.insert(rule.name.clone()) {
            return Err(RuleError::DuplicateRule(rule.name.to_string()));
        }
    }

    let mut rules = Vec::with_capacity(file.rules.len());
    let mut patterns = Vec::new();
    let mut literal_index: IndexMap<Vec<u8>, Vec<PatternId>> = IndexMap::new();
    let mut regexes = Vec::new();

    for rule in &file.rules {
        let mut pattern_ids = Vec::with_capacity(rule.strings.len());

        for decl in &rule.strings {
            let id = patterns.len();
            if id >= MAX_PATTERNS {
                return Err(RuleError::TooManyPatterns {
                    limit: MAX_PATTERNS,
                });
            }
            patterns.push(CompiledPattern {
                identifier: decl.name.clone(),
            });
            pattern_ids.push(id);

            match lower_pattern(decl)? {
                Lowered::Literal(bytes) => {
                    literal_index.entry(bytes).or_default().push(id);
                }
                Lowered::Regex(re) => {
                    regexes.push((id, re));
                }
            }
        }

        validate_condition(rule, &pattern_ids, &patterns)?;

        rules.push(CompiledRule {
            name: rule.name.clone(),
            tags: rule.tags.clone(),
            meta: rule.meta.iter().map(|m| (m.key.clone(), m.value.clone())).collect(),
            condition: rule.condition.clone(),
            patterns: pattern_ids,
        });
    }

    let mut literal_groups = Vec::with_capacity(literal_index.len());
    let literals = if literal_index.is_empty() {
        None
    } else {
        let patvals: Vec<(Vec<u8>, usize)> = literal_index
            .into_iter()
            .enumerate()
            .map(|(group, (bytes, ids))| {
                literal_groups.push(ids);
                (bytes, group)
            })
            .collect();

        let automaton = DoubleArrayAhoCorasick::with_values(patvals).map_err(|e| {
            RuleError::Syntax {
                line: 0,
                message: format!("failed to build pattern automaton: {}", e),
            }
        })?;
        Some(automaton)
    };

    Ok(CompiledRules {
        rules,
        patterns,
        literals,
        literal_groups,
        regexes,
    })
}

enum Lowered {
    Literal(Vec<u8>),
    Regex(regex::bytes::Regex),
}

/// Lower one string declaration into a matching backend
fn lower_pattern(decl: &crate::ast::StringDeclaration) -> RuleResult<Lowered> {
    match &decl.pattern {
        StringPattern::Text(text) => {
            if text.is_empty() {
                return Err(RuleError::EmptyPattern(decl.name.to_string()));
            }
            if !decl.modifiers.nocase && !decl.modifiers.fullword {
                return Ok(Lowered::Literal(text.as_bytes().to_vec()));
            }
            let mut pattern = regex::escape(text);
            if decl.modifiers.fullword {
                pattern = format!(r"\b{}\b", pattern);
            }
            build_regex(&pattern, decl.modifiers.nocase, false)
        }
        StringPattern::Hex(tokens) => {
            if tokens.iter().all(|t| matches!(t, HexToken::Byte(_))) {
                let bytes = tokens
                    .iter()
                    .map(|t| match t {
                        HexToken::Byte(b) => *b,
                        HexToken::Wildcard => unreachable!(),
                    })
                    .collect();
                return Ok(Lowered::Literal(bytes));
            }
            let mut pattern = String::new();
            for token in tokens {
                match token {
                    HexToken::Byte(b) => {
                        let _ = write!(pattern, r"\x{:02X}", b);
                    }
                    HexToken::Wildcard => pattern.push('.'),
                }
            }
            build_regex(&pattern, false, true)
        }
        StringPattern::Regex {
            pattern,
            case_insensitive,
            dot_matches_newline,
        } => build_regex(pattern, *case_insensitive, *dot_matches_newline),
    }
}

fn build_regex(pattern: &str, nocase: bool, dot_all: bool) -> RuleResult<Lowered> {
    regex::bytes::RegexBuilder::new(pattern)
        .unicode(false)
        .case_insensitive(nocase)
        .dot_matches_new_line(dot_all)
        .build()
        .map(Lowered::Regex)
        .map_err(|e| RuleError::InvalidRegex {
            pattern: pattern.to_string(),
            error: e.to_string(),
        })
}

/// Reject conditions that reference undeclared strings
fn validate_condition(
    rule: &Rule,
    pattern_ids: &[PatternId],
    patterns: &[CompiledPattern],
) -> RuleResult<()> {
    let declared: HashSet<&str> = pattern_ids
        .iter()
        .map(|&id| patterns[id].identifier.as_str())
        .collect();

    let mut stack = vec![&rule.condition];
    while let Some(expr) = stack.pop() {
        match expr {
            Expr::StringRef(name) | Expr::StringCount(name) => {
                if !declared.contains(name.as_str()) {
                    return Err(RuleError::UndefinedString {
                        rule: rule.name.to_string(),
                        reference: name.to_string(),
                    });
                }
            }
            Expr::StringAt { name, offset } => {
                if !declared.contains(name.as_str()) {
                    return Err(RuleError::UndefinedString {
                        rule: rule.name.to_string(),
                        reference: name.to_string(),
                    });
                }
                stack.push(offset);
            }
            Expr::Not(inner) => stack.push(inner),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                stack.push(lhs);
                stack.push(rhs);
            }
            Expr::Cmp { lhs, rhs, .. } | Expr::StrOp { lhs, rhs, .. } => {
                stack.push(lhs);
                stack.push(rhs);
            }
            Expr::ReadInt { offset, .. } => stack.push(offset),
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_compile_simple_rule() {
        let rules = compile("rule t { condition: true }").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules[0].name.as_str(), "t");
    }

    #[test]
    fn test_compile_literal_patterns_share_automaton() {
        let source = r#"
            rule a { strings: $x = "MZ" condition: $x }
            rule b { strings: $y = "MZ" condition: $y }
        "#;
        let rules = compile(source).unwrap();
        assert_eq!(rules.pattern_count(), 2);
        // Both patterns collapse onto one automaton entry
        assert_eq!(rules.literal_groups.len(), 1);
        assert_eq!(rules.literal_groups[0].len(), 2);
    }

    #[test]
    fn test_compile_nocase_goes_to_regex() {
        let source = r#"rule t { strings: $a = "Invoice" nocase condition: $a }"#;
        let rules = compile(source).unwrap();
        assert!(rules.literals.is_none());
        assert_eq!(rules.regexes.len(), 1);
    }

    #[test]
    fn test_compile_wildcard_hex_goes_to_regex() {
        let source = "rule t { strings: $h = { E8 ?? ?? 00 } condition: $h }";
        let rules = compile(source).unwrap();
        assert_eq!(rules.regexes.len(), 1);
    }

    #[test]
    fn test_compile_duplicate_rule_name() {
        let source = "rule t { condition: true } rule t { condition: false }";
        assert!(matches!(compile(source), Err(RuleError::DuplicateRule(_))));
    }

    #[test]
    fn test_compile_undefined_string_reference() {
        let source = "rule t { condition: $missing }";
        assert!(matches!(
            compile(source),
            Err(RuleError::UndefinedString { .. })
        ));
    }

    #[test]
    fn test_compile_invalid_regex() {
        let source = r"rule t { strings: $r = /evil[/ condition: $r }";
        assert!(matches!(compile(source), Err(RuleError::InvalidRegex { .. })));
    }

    #[test]
    fn test_compile_meta_lookup() {
        let source = r#"
            rule t {
                meta:
                    scan_modules = "META_HASH"
                condition: true
            }
        "#;
        let rules = compile(source).unwrap();
        let rule = &rules.rules[0];
        assert_eq!(
            rule.meta_get("scan_modules").and_then(|v| v.as_str()),
            Some("META_HASH")
        );
    }
}
