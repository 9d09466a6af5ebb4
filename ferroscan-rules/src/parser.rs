//! Rule parser
//!
//! Hand-written recursive-descent parser over the token stream produced by
//! the lexer. Builds the AST defined in [`crate::ast`].

use smol_str::SmolStr;

use crate::ast::{
    CmpOp, Expr, HexToken, IntWidth, MetaEntry, MetaValue, Quantifier, Rule, SourceFile,
    StringDeclaration, StringModifiers, StringPattern, StrOp,
};
use crate::error::{RuleError, RuleResult};
use crate::lexer::{line_of, tokenize, SpannedToken, Token};

/// Parse rule source into a [`SourceFile`]
pub fn parse(source: &str) -> RuleResult<SourceFile> {
    let tokens = tokenize(source)?;
    Parser::new(source, tokens).parse_source_file()
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<SpannedToken>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn parse_source_file(mut self) -> RuleResult<SourceFile> {
        let mut file = SourceFile::default();

        while let Some(token) = self.peek() {
            match token {
                Token::Import => {
                    self.advance();
                    let name = self.expect_string("module name after import")?;
                    file.imports.push(name);
                }
                Token::Include => {
                    let line = self.current_line();
                    return Err(RuleError::Io(format!(
                        "include at line {} (includes are not resolved; concatenate rule files)",
                        line
                    )));
                }
                Token::Rule => {
                    file.rules.push(self.parse_rule()?);
                }
                _ => return Err(self.unexpected("'rule', 'import' or end of file")),
            }
        }

        Ok(file)
    }

    fn parse_rule(&mut self) -> RuleResult<Rule> {
        self.expect(Token::Rule)?;
        let name = self.expect_identifier("rule name")?;

        // Optional tags: `rule name : tag1 tag2 {`
        let mut tags = Vec::new();
        if self.eat(&Token::Colon) {
            while let Some(Token::Identifier(_)) = self.peek() {
                tags.push(self.expect_identifier("tag")?);
            }
        }

        self.expect(Token::LBrace)?;

        let mut meta = Vec::new();
        let mut strings = Vec::new();

        if self.eat(&Token::Meta) {
            self.expect(Token::Colon)?;
            meta = self.parse_meta_entries()?;
        }

        if self.eat(&Token::Strings) {
            self.expect(Token::Colon)?;
            strings = self.parse_string_declarations()?;
        }

        self.expect(Token::Condition)?;
        self.expect(Token::Colon)?;
        let condition = self.parse_expr()?;

        self.expect(Token::RBrace)?;

        Ok(Rule {
            name,
            tags,
            meta,
            strings,
            condition,
        })
    }

    fn parse_meta_entries(&mut self) -> RuleResult<Vec<MetaEntry>> {
        let mut entries = Vec::new();

        while let Some(Token::Identifier(_)) = self.peek() {
            let key = self.expect_identifier("meta key")?;
            self.expect(Token::Assign)?;

            let value = match self.next_token()? {
                Token::Str(s) => MetaValue::String(SmolStr::new(s)),
                Token::Integer(i) => MetaValue::Integer(i),
                Token::True => MetaValue::Boolean(true),
                Token::False => MetaValue::Boolean(false),
                _ => return Err(self.unexpected_prev("meta value (string, integer or boolean)")),
            };

            entries.push(MetaEntry { key, value });
        }

        Ok(entries)
    }

    fn parse_string_declarations(&mut self) -> RuleResult<Vec<StringDeclaration>> {
        let mut decls = Vec::new();

        while let Some(Token::StringRef(_)) = self.peek() {
            let name = match self.next_token()? {
                Token::StringRef(s) => SmolStr::new(s),
                _ => unreachable!(),
            };
            self.expect(Token::Assign)?;

            let pattern = match self.next_token()? {
                Token::Str(s) => StringPattern::Text(SmolStr::new(s)),
                Token::HexBody(body) => StringPattern::Hex(self.parse_hex_body(&body)?),
                Token::Regex(raw) => self.parse_regex_literal(&raw)?,
                _ => return Err(self.unexpected_prev("string pattern")),
            };

            let mut modifiers = StringModifiers::default();
            loop {
                match self.peek() {
                    Some(Token::Nocase) => {
                        self.advance();
                        modifiers.nocase = true;
                    }
                    Some(Token::Fullword) => {
                        self.advance();
                        modifiers.fullword = true;
                    }
                    _ => break,
                }
            }

            decls.push(StringDeclaration {
                name,
                pattern,
                modifiers,
            });
        }

        Ok(decls)
    }

    fn parse_hex_body(&mut self, body: &str) -> RuleResult<Vec<HexToken>> {
        let mut tokens = Vec::new();

        for part in body.split_whitespace() {
            if part.len() != 2 {
                return Err(RuleError::InvalidHex(part.to_string()));
            }
            if part == "??" {
                tokens.push(HexToken::Wildcard);
            } else {
                let byte = u8::from_str_radix(part, 16)
                    .map_err(|_| RuleError::InvalidHex(part.to_string()))?;
                tokens.push(HexToken::Byte(byte));
            }
        }

        if tokens.is_empty() {
            return Err(RuleError::InvalidHex("empty hex string".to_string()));
        }
        Ok(tokens)
    }

    fn parse_regex_literal(&mut self, raw: &str) -> RuleResult<StringPattern> {
        // raw is `/pattern/flags`
        let close = raw.rfind('/').unwrap_or(0);
        let pattern = &raw[1..close];
        let flags = &raw[close + 1..];

        Ok(StringPattern::Regex {
            pattern: SmolStr::new(pattern),
            case_insensitive: flags.contains('i'),
            dot_matches_newline: flags.contains('s'),
        })
    }

    // Condition grammar, lowest precedence first:
    //   expr     := and_expr ('or' and_expr)*
    //   and_expr := unary ('and' unary)*
    //   unary    := 'not' unary | primary
    fn parse_expr(&mut self) -> RuleResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> RuleResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> RuleResult<Expr> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> RuleResult<Expr> {
        match self.peek() {
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::All) | Some(Token::Any) | Some(Token::None) => {
                let quantifier = match self.next_token()? {
                    Token::All => Quantifier::All,
                    Token::Any => Quantifier::Any,
                    Token::None => Quantifier::None,
                    _ => unreachable!(),
                };
                self.expect(Token::Of)?;
                self.expect(Token::Them)?;
                Ok(Expr::OfThem(quantifier))
            }
            Some(Token::StringRef(_)) => {
                let name = match self.next_token()? {
                    Token::StringRef(s) => SmolStr::new(s),
                    _ => unreachable!(),
                };
                if self.eat(&Token::At) {
                    let offset = self.parse_value()?;
                    Ok(Expr::StringAt {
                        name,
                        offset: Box::new(offset),
                    })
                } else {
                    Ok(Expr::StringRef(name))
                }
            }
            _ => {
                // A value, possibly followed by a comparison or string operator.
                let lhs = self.parse_value()?;
                self.parse_comparison_tail(lhs)
            }
        }
    }

    fn parse_comparison_tail(&mut self, lhs: Expr) -> RuleResult<Expr> {
        let op = match self.peek() {
            Some(Token::Equal) => Some(CmpOp::Eq),
            Some(Token::NotEqual) => Some(CmpOp::Ne),
            Some(Token::LessThan) => Some(CmpOp::Lt),
            Some(Token::LessEqual) => Some(CmpOp::Le),
            Some(Token::GreaterThan) => Some(CmpOp::Gt),
            Some(Token::GreaterEqual) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_value()?;
            return Ok(Expr::Cmp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }

        let str_op = match self.peek() {
            Some(Token::Contains) => Some(StrOp::Contains),
            Some(Token::StartsWith) => Some(StrOp::StartsWith),
            Some(Token::EndsWith) => Some(StrOp::EndsWith),
            _ => None,
        };
        if let Some(op) = str_op {
            self.advance();
            let rhs = self.parse_value()?;
            return Ok(Expr::StrOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }

        // A bare identifier is a boolean external variable reference.
        match lhs {
            Expr::Ident(_) => Ok(lhs),
            _ => Err(self.unexpected("comparison operator")),
        }
    }

    fn parse_value(&mut self) -> RuleResult<Expr> {
        match self.next_token()? {
            Token::Integer(i) => Ok(Expr::Int(i)),
            Token::Str(s) => Ok(Expr::Str(SmolStr::new(s))),
            Token::Filesize => Ok(Expr::Filesize),
            Token::Identifier(name) => Ok(Expr::Ident(SmolStr::new(name))),
            Token::CountRef(name) => Ok(Expr::StringCount(SmolStr::new(name))),
            Token::Uint8 => self.parse_read_int(IntWidth::U8),
            Token::Uint16 => self.parse_read_int(IntWidth::U16),
            Token::Uint32 => self.parse_read_int(IntWidth::U32),
            _ => Err(self.unexpected_prev("value")),
        }
    }

    fn parse_read_int(&mut self, width: IntWidth) -> RuleResult<Expr> {
        self.expect(Token::LParen)?;
        let offset = self.parse_value()?;
        self.expect(Token::RParen)?;
        Ok(Expr::ReadInt {
            width,
            offset: Box::new(offset),
        })
    }

    // ---- token cursor helpers ----

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn next_token(&mut self) -> RuleResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|t| t.token.clone())
            .ok_or_else(|| self.eof("token"))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> RuleResult<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("{}", expected)))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> RuleResult<SmolStr> {
        match self.next_token()? {
            Token::Identifier(name) => Ok(SmolStr::new(name)),
            _ => Err(self.unexpected_prev(what)),
        }
    }

    fn expect_string(&mut self, what: &str) -> RuleResult<SmolStr> {
        match self.next_token()? {
            Token::Str(s) => Ok(SmolStr::new(s)),
            _ => Err(self.unexpected_prev(what)),
        }
    }

    fn current_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| line_of(self.source, t.start))
            .unwrap_or_else(|| line_of(self.source, self.source.len()))
    }

    fn unexpected(&self, expected: &str) -> RuleError {
        let (line, found) = match self.tokens.get(self.pos) {
            Some(t) => (line_of(self.source, t.start), format!("{}", t.token)),
            None => (line_of(self.source, self.source.len()), "end of file".to_string()),
        };
        RuleError::Syntax {
            line,
            message: format!("expected {}, found {}", expected, found),
        }
    }

    fn unexpected_prev(&self, expected: &str) -> RuleError {
        let idx = self.pos.saturating_sub(1);
        let (line, found) = match self.tokens.get(idx) {
            Some(t) => (line_of(self.source, t.start), format!("{}", t.token)),
            None => (line_of(self.source, self.source.len()), "end of file".to_string()),
        };
        RuleError::Syntax {
            line,
            message: format!("expected {}, found {}", expected, found),
        }
    }

    fn eof(&self, expected: &str) -> RuleError {
        RuleError::Syntax {
            line: line_of(self.source, self.source.len()),
            message: format!("expected {}, found end of file", expected),
        }
    }
}
