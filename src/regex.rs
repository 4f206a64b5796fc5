//! Regular expressions lowered to grammar rules.
//!
//! Patterns go through `regex-syntax` and the resulting HIR is printed back
//! as EBNF, so a regex constraint and a `pattern` inside a JSON Schema share
//! the same front end as hand-written grammars. The whole pattern is one
//! rule; the automaton builder inlines it into a single DFA.

use regex_syntax::hir::{Class, Hir, HirKind, Look};
use regex_syntax::ParserBuilder;

use crate::error::{GrammarError, Result};
use crate::grammar::ebnf::{class_char, quote_bytes, quote_literal};
use crate::grammar::{analysis, Grammar};

/// Where the lowered expression will be embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexContext {
    /// Bytes are matched as written.
    Plain,
    /// Inside a JSON string: `"` and `\` must appear escaped and control
    /// characters are unavailable.
    JsonString,
}

/// Compile `pattern` into a single-rule grammar rooted at `root`.
pub fn regex_to_grammar(pattern: &str) -> Result<Grammar> {
    let source = regex_to_ebnf(pattern)?;
    let grammar = Grammar::from_ebnf(&source, "root")?;
    analysis::validate(&grammar)?;
    Ok(grammar)
}

/// The EBNF text for `pattern`, as a `root` rule.
pub fn regex_to_ebnf(pattern: &str) -> Result<String> {
    let piece = lower_pattern(pattern, RegexContext::Plain)?;
    Ok(format!("root ::= {}", piece.text))
}

/// An EBNF expression for `pattern` that can be dropped into a larger rule
/// body without further parenthesization.
pub fn regex_expr(pattern: &str, ctx: RegexContext) -> Result<String> {
    Ok(lower_pattern(pattern, ctx)?.atom())
}

fn lower_pattern(pattern: &str, ctx: RegexContext) -> Result<Piece> {
    let hir = ParserBuilder::new()
        .build()
        .parse(pattern)
        .map_err(|e| GrammarError::invalid(format!("regex `{pattern}`: {e}")))?;
    lower(&hir, ctx).map_err(|e| e.context(format_args!("regex `{pattern}`")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Atom,
    Seq,
    Alt,
}

#[derive(Debug)]
struct Piece {
    text: String,
    shape: Shape,
}

impl Piece {
    fn atom_text(text: String) -> Self {
        Piece {
            text,
            shape: Shape::Atom,
        }
    }

    fn empty() -> Self {
        Piece::atom_text("\"\"".into())
    }

    fn is_empty(&self) -> bool {
        self.text == "\"\""
    }

    fn atom(self) -> String {
        match self.shape {
            Shape::Atom => self.text,
            _ => format!("({})", self.text),
        }
    }
}

fn lower(hir: &Hir, ctx: RegexContext) -> Result<Piece> {
    match hir.kind() {
        HirKind::Empty => Ok(Piece::empty()),
        HirKind::Literal(lit) => Ok(Piece::atom_text(literal(&lit.0, ctx))),
        HirKind::Class(Class::Unicode(cls)) => {
            let ranges: Vec<(u32, u32)> = cls
                .iter()
                .map(|r| (r.start() as u32, r.end() as u32))
                .collect();
            Ok(class(&ranges, ctx))
        }
        HirKind::Class(Class::Bytes(cls)) => {
            if cls.iter().any(|r| r.end() > 0x7F) {
                return Err(GrammarError::invalid(
                    "byte classes beyond ASCII are not supported",
                ));
            }
            let ranges: Vec<(u32, u32)> = cls
                .iter()
                .map(|r| (r.start() as u32, r.end() as u32))
                .collect();
            Ok(class(&ranges, ctx))
        }
        HirKind::Look(look) => match look {
            // Constrained output is matched whole, so line and text anchors
            // hold trivially at the ends.
            Look::Start
            | Look::End
            | Look::StartLF
            | Look::EndLF
            | Look::StartCRLF
            | Look::EndCRLF => Ok(Piece::empty()),
            other => Err(GrammarError::invalid(format!(
                "assertion {other:?} is not supported"
            ))),
        },
        HirKind::Repetition(rep) => {
            let sub = lower(&rep.sub, ctx)?;
            let quant = match (rep.min, rep.max) {
                (0, None) => "*".to_string(),
                (1, None) => "+".to_string(),
                (0, Some(1)) => "?".to_string(),
                (m, None) => format!("{{{m},}}"),
                (m, Some(n)) if m == n => format!("{{{m}}}"),
                (m, Some(n)) => format!("{{{m},{n}}}"),
            };
            if sub.is_empty() {
                return Ok(Piece::empty());
            }
            Ok(Piece::atom_text(format!("{}{quant}", sub.atom())))
        }
        HirKind::Capture(cap) => {
            let sub = lower(&cap.sub, ctx)?;
            Ok(Piece::atom_text(sub.atom()))
        }
        HirKind::Concat(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                let piece = lower(item, ctx)?;
                if piece.is_empty() {
                    continue;
                }
                parts.push(match piece.shape {
                    Shape::Alt => piece.atom(),
                    _ => piece.text,
                });
            }
            Ok(match parts.len() {
                0 => Piece::empty(),
                1 => Piece::atom_text(parts.remove(0)),
                _ => Piece {
                    text: parts.join(" "),
                    shape: Shape::Seq,
                },
            })
        }
        HirKind::Alternation(alts) => {
            let parts = alts
                .iter()
                .map(|alt| lower(alt, ctx).map(|p| p.text))
                .collect::<Result<Vec<_>>>()?;
            Ok(Piece {
                text: parts.join(" | "),
                shape: Shape::Alt,
            })
        }
    }
}

fn literal(bytes: &[u8], ctx: RegexContext) -> String {
    match ctx {
        RegexContext::Plain => quote_bytes(bytes),
        RegexContext::JsonString => {
            let mut escaped = String::with_capacity(bytes.len());
            for chunk in bytes.utf8_chunks() {
                for c in chunk.valid().chars() {
                    push_json_char(&mut escaped, c);
                }
            }
            quote_literal(&escaped)
        }
    }
}

/// Append `c` the way it must appear inside a JSON string literal.
pub(crate) fn push_json_char(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        '\u{08}' => out.push_str("\\b"),
        '\u{0c}' => out.push_str("\\f"),
        c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
        c => out.push(c),
    }
}

fn class_text(ranges: &[(u32, u32)]) -> String {
    let mut out = String::from("[");
    for &(lo, hi) in ranges {
        out.push_str(&class_char(lo));
        if hi != lo {
            out.push('-');
            out.push_str(&class_char(hi));
        }
    }
    out.push(']');
    out
}

fn class(ranges: &[(u32, u32)], ctx: RegexContext) -> Piece {
    if ctx == RegexContext::Plain {
        return Piece::atom_text(class_text(ranges));
    }
    let contains = |cp: u32| ranges.iter().any(|&(lo, hi)| lo <= cp && cp <= hi);
    let mut plain = Vec::with_capacity(ranges.len() + 2);
    for &(lo, hi) in ranges {
        let lo = lo.max(0x20);
        if lo > hi {
            continue;
        }
        let mut start = lo;
        for cut in [0x22u32, 0x5C] {
            if start <= cut && cut <= hi {
                if start < cut {
                    plain.push((start, cut - 1));
                }
                start = cut + 1;
            }
        }
        if start <= hi {
            plain.push((start, hi));
        }
    }
    let mut alts = Vec::new();
    if !plain.is_empty() {
        alts.push(class_text(&plain));
    }
    if contains(0x22) {
        alts.push(quote_literal("\\\""));
    }
    if contains(0x5C) {
        alts.push(quote_literal("\\\\"));
    }
    match alts.len() {
        // Nothing in the class can appear in a JSON string.
        0 => Piece::atom_text("[]".into()),
        1 => Piece::atom_text(alts.remove(0)),
        _ => Piece {
            text: alts.join(" | "),
            shape: Shape::Alt,
        },
    }
}
