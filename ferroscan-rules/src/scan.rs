//! Pattern search and condition evaluation
//!
//! Scanning runs in two phases: the literal automaton and the regex set
//! locate every string hit, then each rule's condition is evaluated directly
//! over the hit table and the external variables.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::ast::{CmpOp, Expr, IntWidth, MetaValue, Quantifier, StrOp};
use crate::compile::{CompiledRules, PatternId};

/// Cap on recorded hits per pattern; later occurrences are not collected
const MAX_HITS_PER_PATTERN: usize = 1_000;

/// An external variable value
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// External variables exposed to rule conditions
///
/// Conditions reference these as bare identifiers. Undefined identifiers
/// evaluate as undefined, which never satisfies a condition.
#[derive(Debug, Clone, Default)]
pub struct RuleInputs {
    vars: IndexMap<SmolStr, ExternalValue>,
}

impl RuleInputs {
    /// Create an empty variable set
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a string variable
    pub fn set_str(&mut self, name: impl Into<SmolStr>, value: impl Into<String>) {
        self.vars.insert(name.into(), ExternalValue::Str(value.into()));
    }

    /// Define an integer variable
    pub fn set_int(&mut self, name: impl Into<SmolStr>, value: i64) {
        self.vars.insert(name.into(), ExternalValue::Int(value));
    }

    /// Define a boolean variable
    pub fn set_bool(&mut self, name: impl Into<SmolStr>, value: bool) {
        self.vars.insert(name.into(), ExternalValue::Bool(value));
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&ExternalValue> {
        self.vars.get(name)
    }
}

/// A matched rule
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// Rule name
    pub name: SmolStr,
    /// Rule tags
    pub tags: Vec<SmolStr>,
    /// Rule metadata
    pub meta: Vec<(SmolStr, MetaValue)>,
    /// Strings that hit, with their offsets and matched bytes
    pub strings: Vec<StringMatch>,
}

/// Hits for one string identifier
#[derive(Debug, Clone)]
pub struct StringMatch {
    /// Identifier without the `$` sigil
    pub identifier: SmolStr,
    /// Individual hits
    pub hits: Vec<StringHit>,
}

/// A single string hit
#[derive(Debug, Clone, PartialEq)]
pub struct StringHit {
    /// Byte offset of the hit
    pub offset: u64,
    /// The matched bytes
    pub data: Vec<u8>,
}

impl CompiledRules {
    /// Match the rule set against a buffer
    ///
    /// Returns the rules whose conditions hold, in declaration order.
    /// Scanning a 0-byte buffer is permitted and matches only rules whose
    /// conditions need no string hits.
    pub fn scan(&self, data: &[u8], inputs: &RuleInputs) -> Vec<RuleMatch> {
        let hits = self.collect_hits(data);

        let mut matches = Vec::new();
        for rule in &self.rules {
            let env = Env {
                data,
                inputs,
                hits: &hits,
                rule_patterns: &rule.patterns,
                pattern_table: &self.patterns,
            };
            if eval(&rule.condition, &env).to_bool() {
                matches.push(self.build_match(rule, data, &hits));
            }
        }
        matches
    }

    /// Names of matched rules, for callers that only branch on membership
    pub fn matched_names(&self, data: &[u8], inputs: &RuleInputs) -> Vec<SmolStr> {
        self.scan(data, inputs).into_iter().map(|m| m.name).collect()
    }

    fn collect_hits(&self, data: &[u8]) -> Vec<Vec<(usize, usize)>> {
        let mut hits: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.patterns.len()];

        if let Some(automaton) = &self.literals {
            for m in automaton.find_overlapping_iter(data) {
                for &id in &self.literal_groups[m.value()] {
                    let slot = &mut hits[id];
                    if slot.len() < MAX_HITS_PER_PATTERN {
                        slot.push((m.start(), m.end() - m.start()));
                    }
                }
            }
        }

        for (id, re) in &self.regexes {
            let slot = &mut hits[*id];
            for m in re.find_iter(data) {
                if slot.len() >= MAX_HITS_PER_PATTERN {
                    break;
                }
                slot.push((m.start(), m.end() - m.start()));
            }
        }

        // The automaton reports in automaton order; rules observe offsets
        for slot in &mut hits {
            slot.sort_unstable();
        }
        hits
    }

    fn build_match(
        &self,
        rule: &crate::compile::CompiledRule,
        data: &[u8],
        hits: &[Vec<(usize, usize)>],
    ) -> RuleMatch {
        let strings = rule
            .patterns
            .iter()
            .filter(|&&id| !hits[id].is_empty())
            .map(|&id| StringMatch {
                identifier: self.patterns[id].identifier.clone(),
                hits: hits[id]
                    .iter()
                    .map(|&(offset, len)| StringHit {
                        offset: offset as u64,
                        data: data[offset..offset + len].to_vec(),
                    })
                    .collect(),
            })
            .collect();

        RuleMatch {
            name: rule.name.clone(),
            tags: rule.tags.clone(),
            meta: rule.meta.clone(),
            strings,
        }
    }
}

/// Evaluation environment for one rule
struct Env<'a> {
    data: &'a [u8],
    inputs: &'a RuleInputs,
    hits: &'a [Vec<(usize, usize)>],
    rule_patterns: &'a [PatternId],
    pattern_table: &'a [crate::compile::CompiledPattern],
}

impl Env<'_> {
    fn hits_for(&self, name: &str) -> Option<&[(usize, usize)]> {
        self.rule_patterns
            .iter()
            .find(|&&id| self.pattern_table[id].identifier == name)
            .map(|&id| self.hits[id].as_slice())
    }
}

/// Runtime value with undefined propagation
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    Str(SmolStr),
    Undefined,
}

impl Value {
    fn to_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }
}

fn eval(expr: &Expr, env: &Env<'_>) -> Value {
    match expr {
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Int(i) => Value::Int(*i),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Filesize => Value::Int(env.data.len() as i64),
        Expr::Ident(name) => match env.inputs.get(name) {
            Some(ExternalValue::Str(s)) => Value::Str(SmolStr::new(s)),
            Some(ExternalValue::Int(i)) => Value::Int(*i),
            Some(ExternalValue::Bool(b)) => Value::Bool(*b),
            None => Value::Undefined,
        },
        Expr::StringRef(name) => match env.hits_for(name) {
            Some(hits) => Value::Bool(!hits.is_empty()),
            None => Value::Undefined,
        },
        Expr::StringAt { name, offset } => {
            let at = match eval(offset, env) {
                Value::Int(i) if i >= 0 => i as usize,
                _ => return Value::Undefined,
            };
            match env.hits_for(name) {
                Some(hits) => Value::Bool(hits.iter().any(|&(off, _)| off == at)),
                None => Value::Undefined,
            }
        }
        Expr::StringCount(name) => match env.hits_for(name) {
            Some(hits) => Value::Int(hits.len() as i64),
            None => Value::Undefined,
        },
        Expr::ReadInt { width, offset } => {
            let at = match eval(offset, env) {
                Value::Int(i) if i >= 0 => i as usize,
                _ => return Value::Undefined,
            };
            read_int(env.data, at, *width)
        }
        Expr::OfThem(quantifier) => {
            if env.rule_patterns.is_empty() {
                return Value::Undefined;
            }
            let matched = env
                .rule_patterns
                .iter()
                .filter(|&&id| !env.hits[id].is_empty())
                .count();
            let total = env.rule_patterns.len();
            Value::Bool(match quantifier {
                Quantifier::All => matched == total,
                Quantifier::Any => matched > 0,
                Quantifier::None => matched == 0,
            })
        }
        Expr::Not(inner) => match eval(inner, env) {
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Undefined,
        },
        Expr::And(lhs, rhs) => {
            Value::Bool(eval(lhs, env).to_bool() && eval(rhs, env).to_bool())
        }
        Expr::Or(lhs, rhs) => {
            Value::Bool(eval(lhs, env).to_bool() || eval(rhs, env).to_bool())
        }
        Expr::Cmp { op, lhs, rhs } => compare(*op, eval(lhs, env), eval(rhs, env)),
        Expr::StrOp { op, lhs, rhs } => {
            match (eval(lhs, env), eval(rhs, env)) {
                (Value::Str(l), Value::Str(r)) => Value::Bool(match op {
                    StrOp::Contains => l.contains(r.as_str()),
                    StrOp::StartsWith => l.starts_with(r.as_str()),
                    StrOp::EndsWith => l.ends_with(r.as_str()),
                }),
                _ => Value::Undefined,
            }
        }
    }
}

fn compare(op: CmpOp, lhs: Value, rhs: Value) -> Value {
    match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => Value::Bool(match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        }),
        (Value::Str(l), Value::Str(r)) => Value::Bool(match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        }),
        (Value::Bool(l), Value::Bool(r)) => match op {
            CmpOp::Eq => Value::Bool(l == r),
            CmpOp::Ne => Value::Bool(l != r),
            _ => Value::Undefined,
        },
        _ => Value::Undefined,
    }
}

fn read_int(data: &[u8], offset: usize, width: IntWidth) -> Value {
    match width {
        IntWidth::U8 => data
            .get(offset)
            .map(|&b| Value::Int(b as i64))
            .unwrap_or(Value::Undefined),
        IntWidth::U16 => {
            if offset + 2 > data.len() {
                return Value::Undefined;
            }
            Value::Int(u16::from_le_bytes([data[offset], data[offset + 1]]) as i64)
        }
        IntWidth::U32 => {
            if offset + 4 > data.len() {
                return Value::Undefined;
            }
            Value::Int(u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;

    #[test]
    fn test_scan_literal_offsets() {
        let rules = compile(r#"rule t { strings: $a = "scan" condition: $a }"#).unwrap();
        let matches = rules.scan(b"scan me, then scan again", &RuleInputs::new());

        assert_eq!(matches.len(), 1);
        let hits = &matches[0].strings[0].hits;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].offset, 0);
        assert_eq!(hits[1].offset, 14);
        assert_eq!(hits[0].data, b"scan".to_vec());
    }

    #[test]
    fn test_scan_no_match() {
        let rules = compile(r#"rule t { strings: $a = "missing" condition: $a }"#).unwrap();
        assert!(rules.scan(b"nothing here", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_empty_buffer() {
        let rules = compile(
            r#"
            rule needs_string { strings: $a = "x" condition: $a }
            rule always { condition: true }
            "#,
        )
        .unwrap();
        let matches = rules.scan(b"", &RuleInputs::new());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name.as_str(), "always");
    }

    #[test]
    fn test_scan_nocase() {
        let rules =
            compile(r#"rule t { strings: $a = "invoice" nocase condition: $a }"#).unwrap();
        assert_eq!(rules.scan(b"INVOICE attached", &RuleInputs::new()).len(), 1);
    }

    #[test]
    fn test_scan_fullword() {
        let rules =
            compile(r#"rule t { strings: $a = "exe" fullword condition: $a }"#).unwrap();
        assert!(rules.scan(b"flexed", &RuleInputs::new()).is_empty());
        assert_eq!(rules.scan(b"an exe file", &RuleInputs::new()).len(), 1);
    }

    #[test]
    fn test_scan_hex_magic_at_zero() {
        let rules = compile(
            "rule zip { strings: $pk = { 50 4B 03 04 } condition: $pk at 0 }",
        )
        .unwrap();
        assert_eq!(rules.scan(b"PK\x03\x04rest", &RuleInputs::new()).len(), 1);
        assert!(rules.scan(b"xPK\x03\x04", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_wildcard_hex() {
        let rules = compile("rule t { strings: $h = { 4D ?? 90 } condition: $h }").unwrap();
        assert_eq!(rules.scan(b"\x4D\x5A\x90\x00", &RuleInputs::new()).len(), 1);
    }

    #[test]
    fn test_scan_uint_reads() {
        let rules = compile("rule mz { condition: uint16(0) == 0x5A4D }").unwrap();
        assert_eq!(rules.scan(b"MZ\x90\x00", &RuleInputs::new()).len(), 1);
        assert!(rules.scan(b"M", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_filesize() {
        let rules = compile("rule big { condition: filesize > 4 }").unwrap();
        assert_eq!(rules.scan(b"12345", &RuleInputs::new()).len(), 1);
        assert!(rules.scan(b"123", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_quantifiers() {
        let rules = compile(
            r#"rule t { strings: $a = "foo" $b = "bar" condition: all of them }"#,
        )
        .unwrap();
        assert_eq!(rules.scan(b"foo and bar", &RuleInputs::new()).len(), 1);
        assert!(rules.scan(b"only foo", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_string_count() {
        let rules = compile(r#"rule t { strings: $a = "ha" condition: #a >= 3 }"#).unwrap();
        assert_eq!(rules.scan(b"hahaha", &RuleInputs::new()).len(), 1);
        assert!(rules.scan(b"haha", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_external_string_variable() {
        let rules = compile(
            r#"rule docm { condition: filename endswith ".docm" }"#,
        )
        .unwrap();

        let mut inputs = RuleInputs::new();
        inputs.set_str("filename", "invoice.docm");
        assert_eq!(rules.scan(b"", &inputs).len(), 1);

        let mut inputs = RuleInputs::new();
        inputs.set_str("filename", "notes.txt");
        assert!(rules.scan(b"", &inputs).is_empty());
    }

    #[test]
    fn test_scan_external_int_variable() {
        let rules = compile("rule hot { condition: priority > 50 }").unwrap();

        let mut inputs = RuleInputs::new();
        inputs.set_int("priority", 80);
        assert_eq!(rules.scan(b"", &inputs).len(), 1);
    }

    #[test]
    fn test_scan_undefined_variable_is_false() {
        let rules = compile("rule t { condition: priority > 50 }").unwrap();
        assert!(rules.scan(b"", &RuleInputs::new()).is_empty());

        // not-undefined stays undefined rather than becoming true
        let rules = compile("rule t { condition: not (priority > 50) }").unwrap();
        assert!(rules.scan(b"", &RuleInputs::new()).is_empty());
    }

    #[test]
    fn test_scan_deterministic() {
        let rules = compile(
            r#"
            rule a { strings: $x = "aa" condition: $x }
            rule b { strings: $y = /a+/ condition: $y }
            "#,
        )
        .unwrap();
        let first = rules.matched_names(b"aaaa", &RuleInputs::new());
        let second = rules.matched_names(b"aaaa", &RuleInputs::new());
        assert_eq!(first, second);
        assert_eq!(first, vec!["a", "b"]);
    }

    #[test]
    fn test_scan_meta_carried_on_match() {
        let rules = compile(
            r#"
            rule m {
                meta:
                    disposition = "Reject"
                condition: true
            }
            "#,
        )
        .unwrap();
        let matches = rules.scan(b"", &RuleInputs::new());
        assert_eq!(matches[0].meta[0].0.as_str(), "disposition");
    }
}
