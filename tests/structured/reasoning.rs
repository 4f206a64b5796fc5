//! Reasoning spans: unconstrained while thinking, exact resume afterwards.

use std::sync::Arc;

use pie_structured::bitmask;
use pie_structured::{ConstraintSpec, GrammarMatcher, MatcherState, SessionConfig};
use serde_json::json;

use crate::common::{compile, session, vocab};

const TOKENS: [&str; 9] = [
    "<think>",
    "Let me think",
    "</think>",
    "{",
    r#""ok""#,
    ":",
    "true",
    "}",
    " ",
];

const THINK: [u32; 3] = [1, 2, 3];
const ANSWER: [u32; 5] = [4, 5, 6, 7, 8];

fn ok_schema() -> ConstraintSpec {
    ConstraintSpec::JsonSchema(json!({
        "type": "object",
        "properties": {"ok": {"type": "boolean"}},
        "required": ["ok"]
    }))
}

#[test]
fn test_leading_reasoning_span() {
    let v = vocab(&TOKENS);
    let compiled = compile(ok_schema(), &v);
    let fresh = session(ok_schema(), &v).next_token_mask().unwrap();

    let mut m = GrammarMatcher::new(
        Arc::clone(compiled.grammar()),
        SessionConfig {
            start_in_reasoning: true,
            ..SessionConfig::default()
        },
    );
    let initial = m.automaton_state().clone();

    for &token in &THINK {
        m.observe_reasoning(true);
        assert!(m.next_token_mask().is_none());
        let mut bm = bitmask::empty_bitmask(v.vocab_size());
        m.fill_next_token_bitmask(&mut bm);
        assert!(bitmask::is_bitmask_all_ones(&bm, v.vocab_size()));
        assert_eq!(m.consume(token), Ok(MatcherState::Unconstrained));
    }
    assert_eq!(m.automaton_state(), &initial);

    m.observe_reasoning(false);
    assert_eq!(m.next_token_mask().unwrap(), fresh);
    for &token in &ANSWER {
        m.observe_reasoning(false);
        assert_eq!(m.consume(token), Ok(MatcherState::Active));
    }
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
    assert_eq!(m.reasoning_text(), "<think>Let me think</think>");
    assert_eq!(m.content_text(), r#"{"ok":true}"#);
}

#[test]
fn test_reasoning_in_the_middle_of_an_answer() {
    let v = vocab(&TOKENS);
    let mut m = session(ok_schema(), &v);
    m.consume(4).unwrap();
    m.consume(5).unwrap();
    let before = m.next_token_mask().unwrap();

    m.enter_reasoning();
    // Tokens the grammar would refuse are fine while thinking.
    for token in [8, 1, 8, 3] {
        assert_eq!(m.consume(token), Ok(MatcherState::Unconstrained));
    }
    m.exit_reasoning();

    assert_eq!(m.next_token_mask().unwrap(), before);
    for token in [6, 7, 8] {
        m.consume(token).unwrap();
    }
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
    assert_eq!(m.content_text(), r#"{"ok":true}"#);
    assert_eq!(m.reasoning_text(), "}<think>}</think>");
}

#[test]
fn test_stop_during_reasoning_ends_at_the_frozen_state() {
    let v = vocab(&TOKENS);
    let compiled = compile(ok_schema(), &v);

    let mut unfinished = GrammarMatcher::new_in_reasoning(Arc::clone(compiled.grammar()), 4);
    unfinished.consume(2).unwrap();
    assert!(unfinished.consume(0).is_err());
    assert_eq!(unfinished.state(), MatcherState::Rejected);

    let mut m = GrammarMatcher::new(Arc::clone(compiled.grammar()), SessionConfig::default());
    for &token in &ANSWER {
        m.consume(token).unwrap();
    }
    m.enter_reasoning();
    m.consume(2).unwrap();
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
}

#[test]
fn test_rollback_across_a_reasoning_boundary() {
    let v = vocab(&TOKENS);
    let mut m = session(ok_schema(), &v);
    m.consume(4).unwrap();
    m.enter_reasoning();
    m.consume(2).unwrap();
    m.exit_reasoning();
    m.consume(5).unwrap();

    assert_eq!(m.rollback(2), 2);
    // The checkpoint taken before the reasoning token restores its phase.
    assert_eq!(m.state(), MatcherState::Unconstrained);
    assert_eq!(m.reasoning_text(), "");
    assert_eq!(m.content_text(), "{");
}
