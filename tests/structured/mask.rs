//! Masks against a brute-force oracle along real generation walks.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use pie_structured::automaton::{State, Step};
use pie_structured::bitmask;
use pie_structured::{CompiledGrammar, ConstraintSpec, GrammarMatcher, SessionConfig, Vocabulary};
use serde_json::json;

use crate::common::{compile, vocab};

const TOKENS: [&str; 24] = [
    "{", "}", "[", "]", ",", ":", "\"", " ", "\n", "\"a", "\"ab", "ab", "a", "b", "1", "12",
    "-", "0", "true", "tr", "ue", "null", "\"}", "é",
];

/// Token ids whose bytes the automaton accepts from `state`, plus the stop
/// token when `state` is accepting.
fn oracle(compiled: &CompiledGrammar, vocab: &Vocabulary, state: &State) -> Vec<u32> {
    (0..vocab.vocab_size() as u32)
        .filter(|&id| {
            if vocab.is_stop(id) {
                return state.is_accepting();
            }
            let bytes = vocab.token_bytes(id).unwrap_or_default();
            matches!(compiled.automaton().step_bytes(state, bytes), Step::Next(_))
        })
        .collect()
}

/// Whether some byte string leads from `state` to acceptance.
fn can_finish(compiled: &CompiledGrammar, state: &State) -> bool {
    let automaton = compiled.automaton();
    let mut seen = HashSet::from([state.clone()]);
    let mut queue = VecDeque::from([state.clone()]);
    while let Some(state) = queue.pop_front() {
        if state.is_accepting() {
            return true;
        }
        assert!(seen.len() < 100_000, "search too wide");
        for byte in automaton.allowed_bytes(&state) {
            if let Step::Next(next) = automaton.step(&state, byte) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
    }
    false
}

/// Follow a deterministic walk: at step `i` take the `i`-th allowed
/// non-stop token, wrapping around, and compare masks at every state.
fn check_walk(spec: ConstraintSpec, vocab: &Arc<Vocabulary>, steps: usize) {
    let compiled = compile(spec, vocab);
    let grammar = Arc::clone(compiled.grammar());
    let mut m = GrammarMatcher::new(Arc::clone(&grammar), SessionConfig::default());
    let mut bm = bitmask::empty_bitmask(vocab.vocab_size());

    for i in 0..steps {
        let expected = oracle(&grammar, vocab, m.automaton_state());
        let mask = m.next_token_mask().unwrap();
        assert_eq!(mask.allowed_ids(), expected, "step {i}, after {:?}", m.content_text());

        m.fill_next_token_bitmask(&mut bm);
        assert_eq!(bitmask::allowed_ids(&bm).collect::<Vec<_>>(), expected);

        // No allowed token leads into a dead end.
        for &id in &expected {
            if vocab.is_stop(id) {
                continue;
            }
            let bytes = vocab.token_bytes(id).unwrap_or_default();
            let next = grammar.automaton().step_bytes(m.automaton_state(), bytes).into_state().unwrap();
            assert!(can_finish(&grammar, &next), "token {id} after {:?}", m.content_text());
        }

        let choices: Vec<u32> = expected.into_iter().filter(|&id| !vocab.is_stop(id)).collect();
        if choices.is_empty() {
            break;
        }
        m.consume(choices[i % choices.len()]).unwrap();
    }
}

#[test]
fn test_json_schema_walk_matches_oracle() {
    let v = vocab(&TOKENS);
    check_walk(
        ConstraintSpec::JsonSchema(json!({
            "type": "object",
            "properties": {
                "a": {"type": "array", "items": {"type": "integer"}},
                "ab": {"type": ["string", "null"]}
            }
        })),
        &v,
        40,
    );
}

#[test]
fn test_ebnf_walk_matches_oracle() {
    let v = vocab(&TOKENS);
    check_walk(
        ConstraintSpec::Ebnf(
            r#"
root ::= list
list ::= "[" (item ("," item)*)? "]"
item ::= list | "true" | "null" | [0-9]+ | "\"" [abé]* "\""
"#
            .into(),
        ),
        &v,
        60,
    );
}

#[test]
fn test_regex_walk_matches_oracle() {
    let v = vocab(&TOKENS);
    check_walk(ConstraintSpec::Regex(r"(ab|a)+(-?[0-9]{1,3})?".into()), &v, 20);
}

#[test]
fn test_tokens_overrunning_a_bounded_string_are_masked() {
    let v = vocab(&["\"", "\"a", "\"ab", "\"abb", "ab", "abb", "b", "bb\"", "\"b\""]);
    let compiled = compile(
        ConstraintSpec::JsonSchema(json!({"type": "string", "maxLength": 2})),
        &v,
    );
    let grammar = compiled.grammar();
    let start = grammar.initial_state();
    // Ids are shifted by one for `</s>`. `"abb` would need a third
    // character.
    assert_eq!(grammar.mask(&start).allowed_ids(), vec![1, 2, 3, 9]);
    let quote_a = grammar.automaton().step_bytes(&start, b"\"a").into_state().unwrap();
    assert_eq!(grammar.mask(&quote_a).allowed_ids(), vec![1, 7]);
    assert!(can_finish(grammar, &quote_a));
}

#[test]
fn test_multi_byte_character_split_over_tokens() {
    // "é" is 0xC3 0xA9; give the halves their own tokens.
    let v = Arc::new(
        Vocabulary::from_bytes(
            vec![b"</s>".to_vec(), vec![0xC3], vec![0xA9], "é".as_bytes().to_vec(), b"e".to_vec()],
            None,
        )
        .unwrap()
        .with_stop_tokens(&[0])
        .unwrap(),
    );
    let compiled = compile(ConstraintSpec::Regex("é+".into()), &v);
    let mut m = GrammarMatcher::new(Arc::clone(compiled.grammar()), SessionConfig::default());

    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![1, 3]);
    m.consume(1).unwrap();
    assert_eq!(m.pending_bytes(), &[0xC3]);
    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![2]);
    m.consume(2).unwrap();
    assert!(m.pending_bytes().is_empty());
    assert_eq!(m.content_text(), "é");
    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![0, 1, 3]);
}
