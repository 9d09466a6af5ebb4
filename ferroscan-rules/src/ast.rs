//! Rule abstract syntax tree
//!
//! AST nodes produced by the parser and consumed by the compiler.

use smol_str::SmolStr;

/// A complete rule source file
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    /// Imported module names (accepted for compatibility, not resolved)
    pub imports: Vec<SmolStr>,
    /// Rule definitions, in declaration order
    pub rules: Vec<Rule>,
}

/// A single rule definition
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule name
    pub name: SmolStr,
    /// Rule tags
    pub tags: Vec<SmolStr>,
    /// Metadata section
    pub meta: Vec<MetaEntry>,
    /// Strings section
    pub strings: Vec<StringDeclaration>,
    /// Condition expression
    pub condition: Expr,
}

/// Metadata entry: `key = value`
#[derive(Debug, Clone)]
pub struct MetaEntry {
    pub key: SmolStr,
    pub value: MetaValue,
}

/// Metadata value types
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    String(SmolStr),
    Integer(i64),
    Boolean(bool),
}

impl MetaValue {
    /// String form of the value, as written in an action table
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// String declaration in the strings section
#[derive(Debug, Clone)]
pub struct StringDeclaration {
    /// Identifier without the `$` sigil
    pub name: SmolStr,
    /// Pattern body
    pub pattern: StringPattern,
    /// Modifiers
    pub modifiers: StringModifiers,
}

/// String pattern types
#[derive(Debug, Clone)]
pub enum StringPattern {
    /// Text string: "hello"
    Text(SmolStr),
    /// Hex string: { 4D 5A ?? }
    Hex(Vec<HexToken>),
    /// Regular expression: /evil[0-9]+/i
    Regex { pattern: SmolStr, case_insensitive: bool, dot_matches_newline: bool },
}

/// One element of a hex string
#[derive(Debug, Clone, PartialEq)]
pub enum HexToken {
    /// Literal byte
    Byte(u8),
    /// `??` wildcard
    Wildcard,
}

/// String modifiers
#[derive(Debug, Clone, Default)]
pub struct StringModifiers {
    pub nocase: bool,
    pub fullword: bool,
}

/// Condition expression
#[derive(Debug, Clone)]
pub enum Expr {
    /// Boolean literal
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// String literal
    Str(SmolStr),
    /// External variable reference
    Ident(SmolStr),
    /// String reference: $a
    StringRef(SmolStr),
    /// String reference at a fixed offset: $a at 0
    StringAt { name: SmolStr, offset: Box<Expr> },
    /// String match count: #a
    StringCount(SmolStr),
    /// filesize keyword
    Filesize,
    /// Little-endian integer read: uint16(0)
    ReadInt { width: IntWidth, offset: Box<Expr> },
    /// Quantifier over all declared strings: any/all/none of them
    OfThem(Quantifier),
    /// Negation
    Not(Box<Expr>),
    /// Conjunction
    And(Box<Expr>, Box<Expr>),
    /// Disjunction
    Or(Box<Expr>, Box<Expr>),
    /// Ordering or equality comparison
    Cmp { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// String containment operators
    StrOp { op: StrOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

/// Width of a `uintN(offset)` read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    U8,
    U16,
    U32,
}

/// `of them` quantifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    All,
    Any,
    None,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// String operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Contains,
    StartsWith,
    EndsWith,
}
