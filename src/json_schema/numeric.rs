//! Decimal digit-range grammars for bounded integers.
//!
//! A range such as `[-15, 230]` becomes an alternation over digit counts
//! and per-position digit classes, so the automaton accepts exactly the
//! canonical decimal spellings of the integers in the range.

/// Any JSON integer.
pub(super) const INTEGER: &str = r#""-"? ("0" | [1-9] [0-9]*)"#;

/// Any JSON number.
pub(super) const NUMBER: &str =
    r#""-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?"#;

/// An EBNF expression for the integers in `[lo, hi]`; `None` leaves that
/// side open. The caller guarantees the range is non-empty.
pub(super) fn integer_range(lo: Option<i64>, hi: Option<i64>) -> String {
    if lo.is_none() && hi.is_none() {
        return format!("({INTEGER})");
    }
    let mut alts = Vec::with_capacity(2);

    let neg_hi = hi.map_or(-1, |h| h.min(-1));
    if lo.map_or(true, |l| l <= neg_hi) {
        let smallest = neg_hi.unsigned_abs();
        let magnitude = match lo {
            Some(l) => between(smallest, l.unsigned_abs()),
            None => at_least(smallest),
        };
        alts.push(format!(r#""-" {}"#, group(magnitude)));
    }

    let pos_lo = lo.map_or(0, |l| l.max(0));
    if hi.map_or(true, |h| pos_lo <= h) {
        let pos_lo = pos_lo as u64;
        alts.push(group(match hi {
            Some(h) => between(pos_lo, h as u64),
            None => at_least(pos_lo),
        }));
    }

    group(alts)
}

/// Non-negative integers in `[lo, hi]`.
fn between(lo: u64, hi: u64) -> Vec<String> {
    let lo_s = lo.to_string();
    let hi_s = hi.to_string();
    let mut alts = Vec::new();
    for len in lo_s.len()..=hi_s.len() {
        let floor = if len == lo_s.len() {
            lo_s.clone()
        } else {
            format!("1{}", "0".repeat(len - 1))
        };
        let ceil = if len == hi_s.len() {
            hi_s.clone()
        } else {
            "9".repeat(len)
        };
        alts.push(same_length(floor.as_bytes(), ceil.as_bytes()));
    }
    alts
}

/// Non-negative integers `>= lo`.
fn at_least(lo: u64) -> Vec<String> {
    if lo == 0 {
        return vec![r#""0""#.into(), "[1-9] [0-9]*".into()];
    }
    let lo_s = lo.to_string();
    let len = lo_s.len();
    vec![
        same_length(lo_s.as_bytes(), "9".repeat(len).as_bytes()),
        format!("[1-9] [0-9]{{{len},}}"),
    ]
}

/// Digit strings of equal length between `lo` and `hi` inclusive. The
/// result is atomic.
fn same_length(lo: &[u8], hi: &[u8]) -> String {
    let (first_lo, first_hi) = (lo[0], hi[0]);
    if lo.len() == 1 {
        return digit_class(first_lo, first_hi);
    }
    if first_lo == first_hi {
        return format!(
            "({} {})",
            digit_class(first_lo, first_lo),
            same_length(&lo[1..], &hi[1..])
        );
    }

    let rest = lo.len() - 1;
    let lo_is_floor = lo[1..].iter().all(|&d| d == b'0');
    let hi_is_ceil = hi[1..].iter().all(|&d| d == b'9');
    let mut alts = Vec::with_capacity(3);

    let mut mid_lo = first_lo;
    if !lo_is_floor {
        alts.push(format!(
            "{} {}",
            digit_class(first_lo, first_lo),
            same_length(&lo[1..], "9".repeat(rest).as_bytes())
        ));
        mid_lo += 1;
    }
    let mid_hi = if hi_is_ceil { first_hi } else { first_hi - 1 };
    if mid_lo <= mid_hi {
        alts.push(format!("{} {}", digit_class(mid_lo, mid_hi), any_digits(rest)));
    }
    if !hi_is_ceil {
        alts.push(format!(
            "{} {}",
            digit_class(first_hi, first_hi),
            same_length("0".repeat(rest).as_bytes(), &hi[1..])
        ));
    }
    group(alts)
}

fn digit_class(lo: u8, hi: u8) -> String {
    if lo == hi {
        format!("\"{}\"", lo as char)
    } else {
        format!("[{}-{}]", lo as char, hi as char)
    }
}

fn any_digits(n: usize) -> String {
    if n == 1 {
        "[0-9]".into()
    } else {
        format!("[0-9]{{{n}}}")
    }
}

fn group(alts: Vec<String>) -> String {
    if alts.len() == 1 {
        alts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", alts.join(" | "))
    }
}
