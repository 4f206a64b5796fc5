//! The pushdown automaton over per-rule DFAs.
//!
//! A configuration is a stack of `(rule, node)` frames, bottom first. The
//! automaton state is the canonical set of configurations whose top frame
//! can consume a byte, plus a flag saying whether the input seen so far is
//! already a complete match. Advancing maps each configuration through the
//! byte and re-closes over calls and returns; nothing is ever undone.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::{nfa, RuleDfa, NO_EDGE};
use crate::error::Result;
use crate::grammar::{analysis, rewrite, Grammar, RuleId};

/// A position inside one rule's DFA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame {
    pub rule: RuleId,
    pub node: u32,
}

/// A parser stack. The last frame is the rule currently being matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Config(SmallVec<[Frame; 8]>);

impl Config {
    fn root(rule: RuleId) -> Self {
        let mut frames = SmallVec::new();
        frames.push(Frame { rule, node: 0 });
        Config(frames)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    fn top(&self) -> Option<Frame> {
        self.0.last().copied()
    }

    fn set_top_node(&mut self, node: u32) {
        if let Some(top) = self.0.last_mut() {
            top.node = node;
        }
    }
}

/// Live configurations in canonical (sorted, deduplicated) order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Configs {
    Single(Config),
    Set(Arc<[Config]>),
}

impl Configs {
    fn from_vec(mut configs: Vec<Config>) -> Self {
        configs.sort_unstable();
        configs.dedup();
        if configs.len() == 1 {
            if let Some(only) = configs.pop() {
                return Configs::Single(only);
            }
        }
        Configs::Set(configs.into())
    }

    pub fn as_slice(&self) -> &[Config] {
        match self {
            Configs::Single(c) => std::slice::from_ref(c),
            Configs::Set(cs) => cs,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Automaton state. Equal states compare and hash equal, so a state is a
/// valid cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct State {
    configs: Configs,
    accepting: bool,
}

impl State {
    /// The input consumed so far is a complete match.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// At least one more byte can be consumed.
    pub fn can_continue(&self) -> bool {
        !self.configs.is_empty()
    }

    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    pub fn num_configs(&self) -> usize {
        self.configs.len()
    }
}

/// Result of feeding one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Next(State),
    Rejected,
}

impl Step {
    pub fn into_state(self) -> Option<State> {
        match self {
            Step::Next(s) => Some(s),
            Step::Rejected => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Step::Rejected)
    }
}

/// Immutable pushdown automaton compiled from a [`Grammar`].
pub struct PushdownAutomaton {
    rules: Vec<RuleDfa>,
    rule_names: Vec<String>,
    root: RuleId,
    initial: State,
}

impl fmt::Debug for PushdownAutomaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushdownAutomaton")
            .field("root", &self.rule_names[self.root.0 as usize])
            .field("nodes", &self.num_nodes())
            .finish()
    }
}

impl PushdownAutomaton {
    /// Check the grammar and build one DFA per called rule. Left-recursive
    /// rules are rewritten first.
    pub fn build(grammar: &Grammar) -> Result<Self> {
        let rewritten = rewrite::eliminate_left_recursion(grammar)?;
        let grammar = rewritten.as_ref().unwrap_or(grammar);
        analysis::validate(grammar)?;
        let rules = nfa::build_rule_dfas(grammar);
        let mut automaton = PushdownAutomaton {
            rules,
            rule_names: grammar.rules().iter().map(|r| r.name.clone()).collect(),
            root: grammar.root(),
            initial: State {
                configs: Configs::Set(Arc::from(Vec::new())),
                accepting: false,
            },
        };
        automaton.initial = automaton.close(vec![Config::root(grammar.root())]);
        tracing::debug!(
            root = %grammar.root_rule().name,
            rules = grammar.num_rules(),
            nodes = automaton.num_nodes(),
            "built pushdown automaton"
        );
        Ok(automaton)
    }

    pub fn initial_state(&self) -> State {
        self.initial.clone()
    }

    pub fn rule_name(&self, rule: RuleId) -> &str {
        &self.rule_names[rule.0 as usize]
    }

    pub fn num_nodes(&self) -> usize {
        self.rules.iter().map(RuleDfa::num_nodes).sum()
    }

    pub fn memory_size(&self) -> usize {
        self.rules.iter().map(RuleDfa::memory_size).sum::<usize>()
            + self.rule_names.iter().map(String::len).sum::<usize>()
    }

    pub fn is_accepting(&self, state: &State) -> bool {
        state.accepting
    }

    /// Advance `state` by one byte.
    pub fn step(&self, state: &State, byte: u8) -> Step {
        if let Configs::Single(config) = &state.configs {
            if let Some(top) = config.top() {
                let dfa = &self.rules[top.rule.0 as usize];
                let Some(target) = dfa.next(top.node, byte) else {
                    return Step::Rejected;
                };
                // Plain byte move inside one rule: no calls or returns to
                // resolve.
                if !dfa.is_accepting(target) && dfa.calls(target).is_empty() {
                    let mut next = config.clone();
                    next.set_top_node(target);
                    return Step::Next(State {
                        configs: Configs::Single(next),
                        accepting: false,
                    });
                }
            }
        }

        let mut moved = Vec::with_capacity(state.configs.len());
        for config in state.configs.as_slice() {
            let Some(top) = config.top() else { continue };
            if let Some(target) = self.rules[top.rule.0 as usize].next(top.node, byte) {
                let mut next = config.clone();
                next.set_top_node(target);
                moved.push(next);
            }
        }
        if moved.is_empty() {
            return Step::Rejected;
        }
        Step::Next(self.close(moved))
    }

    /// Advance through every byte of `bytes`, stopping at the first
    /// rejection.
    pub fn step_bytes(&self, state: &State, bytes: &[u8]) -> Step {
        let mut current = state.clone();
        for &b in bytes {
            match self.step(&current, b) {
                Step::Next(next) => current = next,
                Step::Rejected => return Step::Rejected,
            }
        }
        Step::Next(current)
    }

    /// Whether `bytes` is a complete match from the initial state.
    pub fn accepts(&self, bytes: &[u8]) -> bool {
        match self.step_bytes(&self.initial, bytes) {
            Step::Next(s) => s.accepting,
            Step::Rejected => false,
        }
    }

    /// Whether `bytes` can be extended (or already is) a complete match.
    pub fn accepts_prefix(&self, bytes: &[u8]) -> bool {
        !self.step_bytes(&self.initial, bytes).is_rejected()
    }

    /// Bytes that do not reject from `state`, ascending.
    pub fn allowed_bytes(&self, state: &State) -> Vec<u8> {
        let mut allowed = [false; 256];
        for config in state.configs.as_slice() {
            let Some(top) = config.top() else { continue };
            let row = self.rules[top.rule.0 as usize].byte_row(top.node);
            for (b, &t) in row.iter().enumerate() {
                if t != NO_EDGE {
                    allowed[b] = true;
                }
            }
        }
        (0u16..256)
            .filter(|&b| allowed[b as usize])
            .map(|b| b as u8)
            .collect()
    }

    /// Resolve calls and returns until every configuration waits on a byte.
    ///
    /// Entering a callee pushes a frame, except when the return point is a
    /// tail node: then the caller frame is replaced. Finishing a rule pops
    /// its frame; popping the last frame means the input is a full match.
    fn close(&self, seeds: Vec<Config>) -> State {
        let mut out = Vec::with_capacity(seeds.len());
        let mut accepting = false;
        let mut seen: FxHashSet<Config> = FxHashSet::default();
        let mut work = seeds;
        while let Some(config) = work.pop() {
            if !seen.insert(config.clone()) {
                continue;
            }
            let Some(top) = config.top() else {
                accepting = true;
                continue;
            };
            let dfa = &self.rules[top.rule.0 as usize];
            if dfa.has_bytes(top.node) {
                out.push(config.clone());
            }
            for &(callee, ret) in dfa.calls(top.node) {
                let mut next = config.clone();
                if dfa.is_tail(ret) {
                    next.0.pop();
                } else {
                    next.set_top_node(ret);
                }
                next.0.push(Frame {
                    rule: callee,
                    node: 0,
                });
                work.push(next);
            }
            if dfa.is_accepting(top.node) {
                let mut next = config;
                next.0.pop();
                work.push(next);
            }
        }
        State {
            configs: Configs::from_vec(out),
            accepting,
        }
    }
}
