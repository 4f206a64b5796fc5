//! The unified grammar representation every constraint compiles into.
//!
//! A [`Grammar`] is a set of named rules whose bodies live in a flat
//! expression arena. Leaves are byte literals and Unicode character classes;
//! interior nodes are sequences, choices, bounded repeats and rule
//! references. JSON Schema, regex and structural tags all lower to this
//! through the EBNF front end in [`ebnf`].

pub mod analysis;
pub mod builder;
pub mod ebnf;
pub mod rewrite;

use std::fmt;

/// Index into the grammar's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

/// Index into the grammar's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

/// A named production.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub body: ExprId,
}

/// Highest Unicode scalar value.
pub const MAX_CODEPOINT: u32 = 0x10FFFF;

/// A set of Unicode codepoints written as inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharClass {
    pub negated: bool,
    pub ranges: Vec<(u32, u32)>,
}

impl CharClass {
    pub fn new(negated: bool, ranges: Vec<(u32, u32)>) -> Self {
        Self { negated, ranges }
    }

    /// The codepoints actually matched, sorted, merged and without surrogates.
    pub fn effective_ranges(&self) -> Vec<(u32, u32)> {
        let merged = merge_ranges(&self.ranges);
        let positive = if self.negated {
            complement_ranges(&merged)
        } else {
            merged
        };
        strip_surrogates(&positive)
    }

    pub fn is_empty(&self) -> bool {
        self.effective_ranges().is_empty()
    }

    pub fn contains(&self, cp: u32) -> bool {
        let hit = self.ranges.iter().any(|&(lo, hi)| lo <= cp && cp <= hi);
        hit != self.negated
    }
}

fn merge_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted: Vec<(u32, u32)> = ranges
        .iter()
        .filter(|(lo, hi)| lo <= hi)
        .map(|&(lo, hi)| (lo, hi.min(MAX_CODEPOINT)))
        .collect();
    sorted.sort_unstable();
    let mut out: Vec<(u32, u32)> = Vec::with_capacity(sorted.len());
    for (lo, hi) in sorted {
        match out.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => out.push((lo, hi)),
        }
    }
    out
}

fn complement_ranges(merged: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut next = 0u32;
    for &(lo, hi) in merged {
        if lo > next {
            out.push((next, lo - 1));
        }
        next = hi + 1;
    }
    if next <= MAX_CODEPOINT {
        out.push((next, MAX_CODEPOINT));
    }
    out
}

fn strip_surrogates(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(lo, hi) in ranges {
        if hi < 0xD800 || lo > 0xDFFF {
            out.push((lo, hi));
            continue;
        }
        if lo < 0xD800 {
            out.push((lo, 0xD7FF));
        }
        if hi > 0xDFFF {
            out.push((0xE000, hi));
        }
    }
    out
}

/// A grammar expression node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Matches the empty string.
    Empty,
    /// A literal byte string (UTF-8 for text literals).
    Literal(Vec<u8>),
    /// One codepoint from the class.
    Class(CharClass),
    /// Zero or more codepoints from the class, without a helper rule.
    ClassStar(CharClass),
    /// A reference to another rule.
    Ref(RuleId),
    /// Concatenation.
    Sequence(Vec<ExprId>),
    /// Alternation.
    Choice(Vec<ExprId>),
    /// `expr{min,max}`; `max = None` is unbounded.
    Repeat {
        expr: ExprId,
        min: u32,
        max: Option<u32>,
    },
}

/// An immutable context-free grammar with a distinguished root rule.
#[derive(Debug, Clone)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root: RuleId,
}

impl Grammar {
    pub fn root(&self) -> RuleId {
        self.root
    }

    pub fn root_rule(&self) -> &Rule {
        self.rule(self.root)
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(|i| RuleId(i as u32))
    }

    /// Approximate heap footprint, used for cache accounting.
    pub fn memory_size(&self) -> usize {
        let rules: usize = self
            .rules
            .iter()
            .map(|r| r.name.len() + std::mem::size_of::<Rule>())
            .sum();
        let exprs: usize = self
            .exprs
            .iter()
            .map(|e| {
                std::mem::size_of::<Expr>()
                    + match e {
                        Expr::Literal(b) => b.len(),
                        Expr::Class(c) | Expr::ClassStar(c) => c.ranges.len() * 8,
                        Expr::Sequence(v) | Expr::Choice(v) => v.len() * 4,
                        _ => 0,
                    }
            })
            .sum();
        rules + exprs
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} ::= ", rule.name)?;
            self.fmt_expr(f, rule.body, false)?;
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId, nested: bool) -> fmt::Result {
        match self.expr(id) {
            Expr::Empty => f.write_str("\"\""),
            Expr::Literal(bytes) => fmt_literal(f, bytes),
            Expr::Class(class) => fmt_class(f, class),
            Expr::ClassStar(class) => {
                fmt_class(f, class)?;
                f.write_str("*")
            }
            Expr::Ref(rule) => f.write_str(&self.rule(*rule).name),
            Expr::Sequence(items) => {
                if nested {
                    f.write_str("(")?;
                }
                for (i, &item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    self.fmt_expr(f, item, true)?;
                }
                if nested {
                    f.write_str(")")?;
                }
                Ok(())
            }
            Expr::Choice(alts) => {
                if nested {
                    f.write_str("(")?;
                }
                for (i, &alt) in alts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    self.fmt_expr(f, alt, true)?;
                }
                if nested {
                    f.write_str(")")?;
                }
                Ok(())
            }
            Expr::Repeat { expr, min, max } => {
                let atomic = matches!(
                    self.expr(*expr),
                    Expr::Literal(_) | Expr::Class(_) | Expr::Ref(_) | Expr::Empty
                );
                if atomic {
                    self.fmt_expr(f, *expr, true)?;
                } else {
                    f.write_str("(")?;
                    self.fmt_expr(f, *expr, false)?;
                    f.write_str(")")?;
                }
                match (min, max) {
                    (0, None) => f.write_str("*"),
                    (1, None) => f.write_str("+"),
                    (0, Some(1)) => f.write_str("?"),
                    (m, None) => write!(f, "{{{m},}}"),
                    (m, Some(n)) if m == n => write!(f, "{{{m}}}"),
                    (m, Some(n)) => write!(f, "{{{m},{n}}}"),
                }
            }
        }
    }
}

fn fmt_literal(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    f.write_str("\"")?;
    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                fmt_str_chars(f, s)?;
                break;
            }
            Err(e) => {
                let (valid, tail) = rest.split_at(e.valid_up_to());
                fmt_str_chars(f, std::str::from_utf8(valid).unwrap_or_default())?;
                let bad = e.error_len().unwrap_or(tail.len()).max(1);
                for b in &tail[..bad] {
                    write!(f, "\\x{b:02x}")?;
                }
                rest = &tail[bad..];
            }
        }
    }
    f.write_str("\"")
}

fn fmt_str_chars(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\x{:02x}", c as u32)?,
            c => write!(f, "{c}")?,
        }
    }
    Ok(())
}

fn fmt_class(f: &mut fmt::Formatter<'_>, class: &CharClass) -> fmt::Result {
    f.write_str("[")?;
    if class.negated {
        f.write_str("^")?;
    }
    for &(lo, hi) in &class.ranges {
        fmt_class_char(f, lo)?;
        if hi != lo {
            f.write_str("-")?;
            fmt_class_char(f, hi)?;
        }
    }
    f.write_str("]")
}

fn fmt_class_char(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
    match cp {
        0x5c => f.write_str("\\\\"),
        0x5d => f.write_str("\\]"),
        0x5b => f.write_str("\\["),
        0x5e => f.write_str("\\^"),
        0x2d => f.write_str("\\-"),
        0x09 => f.write_str("\\t"),
        0x0a => f.write_str("\\n"),
        0x0d => f.write_str("\\r"),
        0x20..=0x7e => write!(f, "{}", cp as u8 as char),
        _ => write!(f, "\\u{{{cp:x}}}"),
    }
}
