//! EBNF front end.
//!
//! Accepted syntax:
//! - `name ::= body` rules; a rule may span several lines
//! - `"..."` and `'...'` literals with `\n \r \t \\ \" \' \xHH \uHHHH \UHHHHHHHH \u{H..}` escapes
//! - `[a-z]`, `[^...]` character classes
//! - grouping `( )`, alternation `|`, juxtaposition for sequences
//! - quantifiers `*`, `+`, `?`, `{n}`, `{n,}`, `{n,m}`
//! - `#` comments to end of line
//!
//! All errors are `InvalidSpecification` carrying a line and column.

use rustc_hash::FxHashMap;

use super::builder::GrammarBuilder;
use super::{CharClass, ExprId, Grammar, MAX_CODEPOINT};
use crate::error::{GrammarError, Result};

/// Upper bound for `{n,m}` counts; larger repeats are almost always a typo
/// and would blow up the automaton.
const MAX_REPEAT: u32 = 10_000;

impl Grammar {
    /// Parse EBNF text. `root` names the start rule.
    pub fn from_ebnf(source: &str, root: &str) -> Result<Grammar> {
        parse_ebnf(source, root)
    }
}

pub fn parse_ebnf(source: &str, root: &str) -> Result<Grammar> {
    Parser::new(source).parse(root)
}

#[derive(Debug, Clone, Copy)]
struct Pos {
    line: usize,
    col: usize,
}

struct Parser<'a> {
    src: &'a str,
    offset: usize,
    pos: Pos,
    builder: GrammarBuilder,
    first_use: FxHashMap<String, Pos>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            offset: 0,
            pos: Pos { line: 1, col: 1 },
            builder: GrammarBuilder::new(),
            first_use: FxHashMap::default(),
        }
    }

    fn error_at(&self, pos: Pos, msg: impl std::fmt::Display) -> GrammarError {
        GrammarError::invalid(format!("line {}, column {}: {msg}", pos.line, pos.col))
    }

    fn error(&self, msg: impl std::fmt::Display) -> GrammarError {
        self.error_at(self.pos, msg)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.offset..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.pos.line += 1;
            self.pos.col = 1;
        } else {
            self.pos.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            match self.peek() {
                Some(found) => Err(self.error(format!("expected `{c}`, found `{found}`"))),
                None => Err(self.error(format!("expected `{c}`, found end of input"))),
            }
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn parse(mut self, root: &str) -> Result<Grammar> {
        self.skip_trivia();
        if self.peek().is_none() {
            return Err(self.error("grammar is empty"));
        }
        while self.peek().is_some() {
            self.parse_rule()?;
            self.skip_trivia();
        }

        let mut undefined: Vec<(&String, &Pos)> = self
            .first_use
            .iter()
            .filter(|(name, _)| {
                self.builder
                    .find_rule(name)
                    .is_some_and(|id| !self.builder.is_defined(id))
            })
            .collect();
        undefined.sort_by_key(|(_, p)| (p.line, p.col));
        if let Some((name, pos)) = undefined.first() {
            return Err(self.error_at(**pos, format!("rule `{name}` is not defined")));
        }
        if self.builder.find_rule(root).is_none() {
            return Err(GrammarError::invalid(format!(
                "grammar must define a `{root}` rule"
            )));
        }
        self.builder.build(root)
    }

    fn at_rule_start(&self) -> bool {
        let rest = self.rest();
        let name_len = rest
            .char_indices()
            .take_while(|&(i, c)| is_name_char(c, i == 0))
            .map(|(i, c)| i + c.len_utf8())
            .last()
            .unwrap_or(0);
        if name_len == 0 {
            return false;
        }
        rest[name_len..].trim_start_matches([' ', '\t']).starts_with("::=")
    }

    fn parse_name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if is_name_char(c, name.is_empty()) {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.error("expected a rule name"));
        }
        Ok(name)
    }

    fn parse_rule(&mut self) -> Result<()> {
        let start = self.pos;
        let name = self.parse_name()?;
        self.skip_trivia();
        if !self.rest().starts_with("::=") {
            return Err(self.error(format!("expected `::=` after rule name `{name}`")));
        }
        for _ in 0..3 {
            self.bump();
        }
        let rule = self.builder.declare_rule(&name);
        if self.builder.is_defined(rule) {
            return Err(self.error_at(start, format!("rule `{name}` is defined more than once")));
        }
        let body = self.parse_choice()?;
        self.builder.define_rule(rule, body);
        Ok(())
    }

    fn parse_choice(&mut self) -> Result<ExprId> {
        let mut alts = vec![self.parse_sequence()?];
        loop {
            self.skip_trivia();
            if !self.eat('|') {
                break;
            }
            alts.push(self.parse_sequence()?);
        }
        Ok(self.builder.choice(alts))
    }

    fn parse_sequence(&mut self) -> Result<ExprId> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some(_) if self.at_rule_start() => break,
                Some(_) => items.push(self.parse_quantified()?),
            }
        }
        Ok(self.builder.sequence(items))
    }

    fn parse_quantified(&mut self) -> Result<ExprId> {
        let (mut expr, mut class) = self.parse_atom()?;
        loop {
            let (min, max) = match self.peek() {
                Some('*') => {
                    self.bump();
                    (0, None)
                }
                Some('+') => {
                    self.bump();
                    (1, None)
                }
                Some('?') => {
                    self.bump();
                    (0, Some(1))
                }
                Some('{') => self.parse_braces()?,
                _ => return Ok(expr),
            };
            expr = match class.take() {
                Some(c) if min == 0 && max.is_none() => self.builder.class_star(c),
                _ => self.builder.repeat(expr, min, max),
            };
        }
    }

    fn parse_braces(&mut self) -> Result<(u32, Option<u32>)> {
        let start = self.pos;
        self.expect('{')?;
        self.skip_trivia();
        let min = self.parse_count()?;
        self.skip_trivia();
        let max = if self.eat(',') {
            self.skip_trivia();
            if self.peek() == Some('}') {
                None
            } else {
                Some(self.parse_count()?)
            }
        } else {
            Some(min)
        };
        self.skip_trivia();
        self.expect('}')?;
        if let Some(max) = max {
            if max < min {
                return Err(self.error_at(start, format!("repeat range {{{min},{max}}} is empty")));
            }
        }
        Ok((min, max))
    }

    fn parse_count(&mut self) -> Result<u32> {
        let mut digits = String::new();
        while let Some(c) = self.peek().filter(char::is_ascii_digit) {
            digits.push(c);
            self.bump();
        }
        if digits.is_empty() {
            return Err(self.error("expected a repeat count"));
        }
        match digits.parse::<u32>() {
            Ok(n) if n <= MAX_REPEAT => Ok(n),
            _ => Err(self.error(format!("repeat count {digits} exceeds {MAX_REPEAT}"))),
        }
    }

    /// Returns the atom and, for a bare character class, the class itself so
    /// a following `*` can become a `ClassStar`.
    fn parse_atom(&mut self) -> Result<(ExprId, Option<CharClass>)> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let inner = self.parse_choice()?;
                self.skip_trivia();
                self.expect(')')?;
                Ok((inner, None))
            }
            Some(q @ ('"' | '\'')) => {
                let bytes = self.parse_literal(q)?;
                Ok((self.builder.literal(&bytes), None))
            }
            Some('[') => {
                let class = self.parse_class()?;
                Ok((self.builder.class(class.clone()), Some(class)))
            }
            Some(c) if is_name_char(c, true) => {
                let pos = self.pos;
                let name = self.parse_name()?;
                self.first_use.entry(name.clone()).or_insert(pos);
                let rule = self.builder.declare_rule(&name);
                Ok((self.builder.rule_ref(rule), None))
            }
            Some(c) => Err(self.error(format!("unexpected character `{c}`"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_literal(&mut self, quote: char) -> Result<Vec<u8>> {
        let start = self.pos;
        self.bump();
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(self.error_at(start, "unterminated string literal"));
                }
                Some(c) if c == quote => {
                    self.bump();
                    return Ok(out);
                }
                Some('\\') => match self.parse_escape()? {
                    Escaped::Byte(b) => out.push(b),
                    Escaped::Char(cp) => push_codepoint(&mut out, cp),
                },
                Some(c) => {
                    self.bump();
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn parse_class(&mut self) -> Result<CharClass> {
        let start = self.pos;
        self.expect('[')?;
        let negated = self.eat('^');
        let mut ranges = Vec::new();
        loop {
            let lo = match self.peek() {
                None | Some('\n') => {
                    return Err(self.error_at(start, "unterminated character class"));
                }
                Some(']') => {
                    self.bump();
                    return Ok(CharClass::new(negated, ranges));
                }
                _ => self.parse_class_char()?,
            };
            let is_range = self.peek() == Some('-')
                && !matches!(self.rest().chars().nth(1), Some(']') | None);
            if is_range {
                self.bump();
                let hi = self.parse_class_char()?;
                if hi < lo {
                    return Err(self.error(format!(
                        "invalid class range {lo:#x}-{hi:#x}: end precedes start"
                    )));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
    }

    fn parse_class_char(&mut self) -> Result<u32> {
        match self.peek() {
            Some('\\') => match self.parse_escape()? {
                Escaped::Byte(b) => Ok(b as u32),
                Escaped::Char(cp) => Ok(cp),
            },
            Some(c) => {
                self.bump();
                Ok(c as u32)
            }
            None => Err(self.error("unterminated character class")),
        }
    }

    fn parse_escape(&mut self) -> Result<Escaped> {
        let start = self.pos;
        self.expect('\\')?;
        let c = self
            .bump()
            .ok_or_else(|| self.error_at(start, "dangling escape"))?;
        let escaped = match c {
            'n' => Escaped::Char(0x0A),
            'r' => Escaped::Char(0x0D),
            't' => Escaped::Char(0x09),
            '0' => Escaped::Char(0x00),
            'f' => Escaped::Char(0x0C),
            'v' => Escaped::Char(0x0B),
            '\\' | '"' | '\'' | '[' | ']' | '-' | '^' | '/' | '(' | ')' | '|' | '.' | '*'
            | '+' | '?' | '{' | '}' | '#' => Escaped::Char(c as u32),
            'x' => {
                let v = self.parse_hex(2, 2, start)?;
                Escaped::Byte(v as u8)
            }
            'u' if self.peek() == Some('{') => {
                self.bump();
                let v = self.parse_hex(1, 6, start)?;
                self.expect('}')?;
                Escaped::Char(v)
            }
            'u' => Escaped::Char(self.parse_hex(4, 4, start)?),
            'U' => Escaped::Char(self.parse_hex(8, 8, start)?),
            other => return Err(self.error_at(start, format!("unknown escape `\\{other}`"))),
        };
        if let Escaped::Char(cp) = escaped {
            if cp > MAX_CODEPOINT || (0xD800..=0xDFFF).contains(&cp) {
                return Err(self.error_at(start, format!("escape {cp:#x} is not a Unicode scalar")));
            }
        }
        Ok(escaped)
    }

    fn parse_hex(&mut self, min: usize, max: usize, start: Pos) -> Result<u32> {
        let mut value = 0u32;
        let mut n = 0;
        while n < max {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    value = value * 16 + d;
                    n += 1;
                    self.bump();
                }
                None => break,
            }
        }
        if n < min {
            return Err(self.error_at(start, "malformed hex escape"));
        }
        Ok(value)
    }
}

enum Escaped {
    /// `\xHH` inside a literal is a raw byte.
    Byte(u8),
    Char(u32),
}

fn is_name_char(c: char, first: bool) -> bool {
    if first {
        c.is_ascii_alphabetic() || c == '_'
    } else {
        c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
    }
}

fn push_codepoint(out: &mut Vec<u8>, cp: u32) {
    if let Some(c) = char::from_u32(cp) {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
}

/// Quote `text` as an EBNF string literal.
pub fn quote_literal(text: &str) -> String {
    quote_bytes(text.as_bytes())
}

/// Quote raw bytes as an EBNF literal; non-UTF-8 bytes use `\xHH`.
pub fn quote_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                    out.push_str(&format!("\\x{:02x}", c as u32));
                }
                c => out.push(c),
            }
        }
        for b in chunk.invalid() {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out.push('"');
    out
}

/// Render one codepoint for use inside `[...]`.
pub fn class_char(cp: u32) -> String {
    match cp {
        0x5c => "\\\\".into(),
        0x5d => "\\]".into(),
        0x5b => "\\[".into(),
        0x5e => "\\^".into(),
        0x2d => "\\-".into(),
        0x0a => "\\n".into(),
        0x0d => "\\r".into(),
        0x09 => "\\t".into(),
        0x21..=0x7e | 0x20 => (cp as u8 as char).to_string(),
        _ => format!("\\u{{{cp:x}}}"),
    }
}
