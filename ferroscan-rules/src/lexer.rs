//! Rule lexer
//!
//! Tokenizes rule source using the Logos library. The accepted syntax is the
//! YARA-compatible subset used by dispatch and disposition tables: text, hex
//! and regex strings, meta sections, and boolean conditions over string
//! references and external variables.

use logos::Logos;
use std::fmt;

use crate::error::{RuleError, RuleResult};

/// Token types for rule source
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*[^*]*\*+(?:[^/*][^*]*\*+)*/")]
pub enum Token {
    // Keywords
    #[token("rule")]
    Rule,

    #[token("import")]
    Import,

    #[token("include")]
    Include,

    #[token("meta")]
    Meta,

    #[token("strings")]
    Strings,

    #[token("condition")]
    Condition,

    #[token("true")]
    True,

    #[token("false")]
    False,

    #[token("not")]
    Not,

    #[token("and")]
    And,

    #[token("or")]
    Or,

    #[token("all")]
    All,

    #[token("any")]
    Any,

    #[token("none")]
    None,

    #[token("of")]
    Of,

    #[token("them")]
    Them,

    #[token("at")]
    At,

    #[token("filesize")]
    Filesize,

    #[token("contains")]
    Contains,

    #[token("startswith")]
    StartsWith,

    #[token("endswith")]
    EndsWith,

    #[token("uint8")]
    Uint8,

    #[token("uint16")]
    Uint16,

    #[token("uint32")]
    Uint32,

    // String modifiers
    #[token("nocase")]
    Nocase,

    #[token("fullword")]
    Fullword,

    // Operators
    #[token("=")]
    Assign,

    #[token("==")]
    Equal,

    #[token("!=")]
    NotEqual,

    #[token("<")]
    LessThan,

    #[token("<=")]
    LessEqual,

    #[token(">")]
    GreaterThan,

    #[token(">=")]
    GreaterEqual,

    // Delimiters
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token(":")]
    Colon,

    #[token(",")]
    Comma,

    // Hex string body: { 4D 5A ?? }. Matched before LBrace; a rule body never
    // consists solely of hex pairs because `condition:` always carries a colon.
    #[regex(r"\{[ \t\r\n0-9a-fA-F?]*\}", hex_body, priority = 3)]
    HexBody(String),

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    // Literals
    #[regex(r#""(?:[^"\\]|\\.)*""#, quoted_string)]
    Str(String),

    // First pattern character may not be `*`, so `/* comment */` stays a comment
    #[regex(r"/(?:[^/\\\n*]|\\.)(?:[^/\\\n]|\\.)*/[is]*", regex_literal)]
    Regex(String),

    #[regex(r"0x[0-9a-fA-F]+", hex_int)]
    #[regex(r"[0-9]+(KB|MB)?", dec_int)]
    Integer(i64),

    #[regex(r"\$[A-Za-z0-9_]+", strip_sigil)]
    StringRef(String),

    #[regex(r"#[A-Za-z0-9_]+", strip_sigil)]
    CountRef(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice().to_string())]
    Identifier(String),
}

fn quoted_string(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let raw = lex.slice();
    unescape(&raw[1..raw.len() - 1])
}

fn regex_literal(lex: &mut logos::Lexer<Token>) -> String {
    lex.slice().to_string()
}

fn hex_body(lex: &mut logos::Lexer<Token>) -> String {
    let raw = lex.slice();
    raw[1..raw.len() - 1].to_string()
}

fn hex_int(lex: &mut logos::Lexer<Token>) -> Option<i64> {
    i64::from_str_radix(&lex.slice()[2..], 16).ok()
}

fn dec_int(lex: &mut logos::Lexer<Token>) -> Option<i64> {
    let raw = lex.slice();
    if let Some(num) = raw.strip_suffix("KB") {
        num.parse::<i64>().ok().map(|n| n * 1024)
    } else if let Some(num) = raw.strip_suffix("MB") {
        num.parse::<i64>().ok().map(|n| n * 1024 * 1024)
    } else {
        raw.parse().ok()
    }
}

fn strip_sigil(lex: &mut logos::Lexer<Token>) -> String {
    lex.slice()[1..].to_string()
}

/// Process escape sequences in a quoted string
fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'x' => {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let byte = u8::from_str_radix(&format!("{}{}", hi, lo), 16).ok()?;
                out.push(byte as char);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }

    Some(out)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Regex(r) => write!(f, "{}", r),
            Token::Integer(i) => write!(f, "{}", i),
            Token::StringRef(s) => write!(f, "${}", s),
            Token::CountRef(s) => write!(f, "#{}", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::HexBody(_) => write!(f, "{{...}}"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A token with its byte span in the source
#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Tokenize rule source into a spanned token stream
pub fn tokenize(source: &str) -> RuleResult<Vec<SpannedToken>> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => tokens.push(SpannedToken {
                token,
                start: span.start,
                end: span.end,
            }),
            Err(_) => {
                return Err(RuleError::Syntax {
                    line: line_of(source, span.start),
                    message: format!("unexpected character '{}'", &source[span.clone()]),
                });
            }
        }
    }

    Ok(tokens)
}

/// 1-based line number of a byte offset
pub fn line_of(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())]
        .bytes()
        .filter(|&b| b == b'\n')
        .count()
        + 1
}
