//! Regex constraints: acceptance, first rejected byte, and token sessions.

use pie_structured::regex::regex_to_grammar;
use pie_structured::{ConstraintSpec, DriftFault, GrammarError, MatcherState};

use crate::common::{accepts, ascii_token, ascii_vocab, compile, first_rejected_byte, session, vocab};

#[test]
fn test_email_like_pattern() {
    let g = regex_to_grammar(r"[a-z]+@[a-z]+\.[a-z]{2,4}").unwrap();
    assert!(accepts(&g, "ada@example.org"));
    assert!(accepts(&g, "x@y.io"));
    assert!(!accepts(&g, "x@y.i"));
    assert!(!accepts(&g, "x@y.infos"));
    assert!(!accepts(&g, "@y.io"));
}

#[test]
fn test_first_rejected_byte() {
    let v = ascii_vocab();
    let compiled = compile(ConstraintSpec::Regex(r"\d{3}-\d{4}".into()), &v);
    let automaton = compiled.grammar().automaton();

    assert_eq!(first_rejected_byte(automaton, b"555-0199"), None);
    assert_eq!(first_rejected_byte(automaton, b"55-0199"), Some(2));
    assert_eq!(first_rejected_byte(automaton, b"555-01a9"), Some(6));
    assert_eq!(first_rejected_byte(automaton, b"555-01999"), Some(8));
}

#[test]
fn test_alternation_and_optional_groups() {
    let g = regex_to_grammar(r"(cat|dog)s?( and (cat|dog)s?)*").unwrap();
    for s in ["cat", "dogs", "cats and dog", "dog and dogs and cat"] {
        assert!(accepts(&g, s), "should accept {s:?}");
    }
    for s in ["", "cow", "cats and", "catss"] {
        assert!(!accepts(&g, s), "should reject {s:?}");
    }
}

#[test]
fn test_unicode_classes() {
    let g = regex_to_grammar(r"[α-ω]+ [0-9]").unwrap();
    assert!(!accepts(&g, "λόγος 1"));
    assert!(accepts(&g, "λογος 1"));
    assert!(!accepts(&g, "logos 1"));
}

#[test]
fn test_unsupported_regex_is_invalid() {
    let v = ascii_vocab();
    for pattern in [r"\bword\b", r"(?=x)y", r"(a)\1", "("] {
        let err = pie_structured::GrammarCache::global()
            .get_or_compile(
                &ConstraintSpec::Regex(pattern.into()),
                &v,
                &Default::default(),
            )
            .unwrap_err();
        assert!(
            matches!(err, GrammarError::InvalidSpecification(_)),
            "{pattern}: {err}"
        );
    }
}

#[test]
fn test_session_over_multi_byte_tokens() {
    let v = vocab(&["555", "-", "01", "99", "0199", "5", "a"]);
    let mut m = session(ConstraintSpec::Regex(r"\d{3}-\d{4}".into()), &v);

    let first = m.next_token_mask().unwrap();
    assert!(first.is_allowed(1));
    assert!(first.is_allowed(6));
    assert!(!first.is_allowed(2));
    assert!(!first.is_allowed(7));
    assert!(!first.is_allowed(0));

    for token in [1, 2, 3] {
        assert_eq!(m.consume(token), Ok(MatcherState::Active));
    }
    // "0199" would overshoot the four digits.
    let mask = m.next_token_mask().unwrap();
    assert!(mask.is_allowed(4));
    assert!(!mask.is_allowed(5));

    assert_eq!(
        m.consume(5),
        Err(DriftFault::OutOfMask { token: 5, position: 8 })
    );
    assert_eq!(m.state(), MatcherState::Rejected);
    assert_eq!(m.rollback(1), 1);
    assert_eq!(m.state(), MatcherState::Active);
    assert_eq!(m.consume(4), Ok(MatcherState::Active));
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
    assert_eq!(m.content_text(), "555-0199");
}

#[test]
fn test_byte_tokens_follow_the_automaton() {
    let v = ascii_vocab();
    let mut m = session(ConstraintSpec::Regex(r"[A-Z][a-z]*".into()), &v);
    assert!(!m.next_token_mask().unwrap().is_allowed(ascii_token(b'a')));
    m.consume(ascii_token(b'H')).unwrap();
    assert!(m.next_token_mask().unwrap().is_allowed(0));
    m.consume(ascii_token(b'i')).unwrap();
    assert_eq!(m.find_jump_forward_string(), "");
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
}
