//! Shared helpers.

use std::sync::Arc;

use pie_structured::automaton::{PushdownAutomaton, Step};
use pie_structured::grammar::Grammar;
use pie_structured::{
    CompiledConstraint, ConstraintSpec, GrammarCache, GrammarMatcher, JsonSchemaOptions,
    SessionConfig, Vocabulary,
};

/// A raw vocabulary with `</s>` as stop token 0.
pub fn vocab(tokens: &[&str]) -> Arc<Vocabulary> {
    let mut all = vec![b"</s>".to_vec()];
    all.extend(tokens.iter().map(|t| t.as_bytes().to_vec()));
    Arc::new(
        Vocabulary::from_bytes(all, None)
            .unwrap()
            .with_stop_tokens(&[0])
            .unwrap(),
    )
}

/// Every printable ASCII byte as its own token, plus `</s>`.
pub fn ascii_vocab() -> Arc<Vocabulary> {
    let mut all = vec![b"</s>".to_vec()];
    all.extend((0x20u8..0x7f).chain([b'\n', b'\t']).map(|b| vec![b]));
    Arc::new(
        Vocabulary::from_bytes(all, None)
            .unwrap()
            .with_stop_tokens(&[0])
            .unwrap(),
    )
}

pub fn compile(spec: ConstraintSpec, vocab: &Arc<Vocabulary>) -> Arc<CompiledConstraint> {
    GrammarCache::global()
        .get_or_compile(&spec, vocab, &JsonSchemaOptions::default())
        .unwrap()
}

pub fn session(spec: ConstraintSpec, vocab: &Arc<Vocabulary>) -> GrammarMatcher {
    let compiled = compile(spec, vocab);
    GrammarMatcher::new(Arc::clone(compiled.grammar()), SessionConfig::default())
}

pub fn accepts(grammar: &Grammar, input: &str) -> bool {
    PushdownAutomaton::build(grammar).unwrap().accepts(input.as_bytes())
}

/// Index of the first byte the automaton rejects, if any.
pub fn first_rejected_byte(automaton: &PushdownAutomaton, input: &[u8]) -> Option<usize> {
    let mut state = automaton.initial_state();
    for (i, &b) in input.iter().enumerate() {
        match automaton.step(&state, b) {
            Step::Next(next) => state = next,
            Step::Rejected => return Some(i),
        }
    }
    None
}

/// Token id of a single byte in [`ascii_vocab`].
pub fn ascii_token(byte: u8) -> u32 {
    match byte {
        0x20..=0x7e => u32::from(byte - 0x20) + 1,
        b'\n' => 96,
        b'\t' => 97,
        other => panic!("byte {other:#x} is not in the ascii vocabulary"),
    }
}
